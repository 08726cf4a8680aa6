//! Infrastructure-level error type shared by config/logging/bootstrap code.
//!
//! Protocol-specific errors (handshake, session, OTA, pub/sub) live in their
//! owning crates — see `device-handshake::HandshakeError`,
//! `device-session::SessionError`, `device-ota::OtaError`,
//! `device-events::EventError`. This type only covers the ambient
//! foundation: configuration and key-material loading.

/// Core infrastructure error type used by `device-common` itself.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for `Result<T, CoreError>`.
pub type CoreResult<T> = Result<T, CoreError>;
