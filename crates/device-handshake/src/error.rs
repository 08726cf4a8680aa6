use thiserror::Error;

/// Failure of a single handshake stage. The stage that failed is identified
/// by the variant itself; the `{connectionKey, remoteAddr, deviceID?}`
/// context the owning spec calls out belongs on the `tracing` event that
/// reports this error, not in the error payload.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake exceeded its global deadline")]
    HandshakeTimeout,

    #[error("failed to decrypt device's core-id payload: {0}")]
    HandshakeDecrypt(#[from] device_crypto::CryptoError),

    #[error("decrypted core-id payload shorter than the minimum 52 bytes (got {0})")]
    HandshakeShortPayload(usize),

    #[error("nonce echoed by device does not match the nonce sent")]
    HandshakeNonceMismatch,

    #[error("no public key on record for device and none was offered in-band")]
    HandshakeUnknownDevice,

    #[error("device's first message after session-key exchange was not Hello")]
    HandshakeExpectedHello,

    #[error(transparent)]
    Wire(#[from] device_wire::WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
