/// Errors surfaced by the crypto primitives. Callers (the handshake state
/// machine) map these onto their own stage-specific error kinds.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("RSA key encoding error: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    #[error("RSA PEM error: {0}")]
    Pem(#[from] rsa::pkcs8::spki::Error),

    #[error("ciphertext length {0} is not a multiple of the AES block size")]
    UnalignedCiphertext(usize),

    #[error("PKCS7 padding is invalid")]
    BadPadding,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key not found for device")]
    KeyNotFound,
}
