use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(std::net::SocketAddr, #[source] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] device_crypto::CryptoError),
}
