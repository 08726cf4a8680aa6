use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("inbound device→server counter desynchronised: expected {expected}, got {got}")]
    CounterMismatch { expected: u32, got: u32 },

    #[error("decrypted frame exceeds the maximum CoAP message size")]
    FrameOversize,

    #[error("send rejected: session is owned by another caller")]
    NotOwner,

    #[error(transparent)]
    Wire(#[from] device_wire::WireError),

    #[error(transparent)]
    Crypto(#[from] device_crypto::CryptoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("the session task is gone")]
    TaskGone,
}
