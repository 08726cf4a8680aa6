//! The 12-byte device identifier sent by a device during handshake.

use std::fmt;
use std::str::FromStr;

/// A canonical 12-byte device identifier, always rendered as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId([u8; 12]);

/// Error returned when parsing or constructing a [`DeviceId`] fails.
#[derive(Debug, thiserror::Error)]
pub enum DeviceIdError {
    #[error("device id must be exactly 12 bytes, got {0}")]
    WrongLength(usize),
    #[error("device id is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl DeviceId {
    /// Build a `DeviceId` from exactly 12 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceIdError> {
        if bytes.len() != 12 {
            return Err(DeviceIdError::WrongLength(bytes.len()));
        }
        let mut buf = [0u8; 12];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Lowercase hex representation, e.g. `"1234567890abcdef12345678"`.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }
}
