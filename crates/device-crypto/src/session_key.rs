//! The 40-byte session key generated by the server during handshake step 4.

use crate::CryptoError;

/// `key = bytes[0..16]`, `iv = bytes[16..32]`, `salt = bytes[32..40]`.
///
/// The first 4 bytes of `iv`, interpreted big-endian, seed the
/// device→server message counter expectation (spec.md §3).
#[derive(Clone)]
pub struct SessionKey {
    bytes: [u8; 40],
}

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 40]) -> Self {
        Self { bytes }
    }

    /// Generate a fresh random session key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 40];
        bytes.copy_from_slice(&crate::random_bytes(40));
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 40] {
        &self.bytes
    }

    pub fn key(&self) -> &[u8; 16] {
        self.bytes[0..16].try_into().unwrap()
    }

    pub fn iv(&self) -> &[u8; 16] {
        self.bytes[16..32].try_into().unwrap()
    }

    pub fn salt(&self) -> &[u8; 8] {
        self.bytes[32..40].try_into().unwrap()
    }

    /// The initial device→server message counter, derived from the top 4
    /// bytes of the IV (big-endian).
    pub fn initial_counter(&self) -> u32 {
        let iv = self.iv();
        u32::from_be_bytes([iv[0], iv[1], iv[2], iv[3]])
    }

    pub fn key_array(&self) -> [u8; 16] {
        *self.key()
    }

    pub fn iv_array(&self) -> [u8; 16] {
        *self.iv()
    }
}

impl TryFrom<&[u8]> for SessionKey {
    type Error = CryptoError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 40 {
            return Err(CryptoError::UnalignedCiphertext(value.len()));
        }
        let mut bytes = [0u8; 40];
        bytes.copy_from_slice(value);
        Ok(Self { bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_counter_matches_iv_prefix() {
        let mut bytes = [0u8; 40];
        bytes[16..20].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        let sk = SessionKey::from_bytes(bytes);
        assert_eq!(sk.initial_counter(), 0xDEAD_BEEF);
    }

    #[test]
    fn field_slices_are_disjoint() {
        let sk = SessionKey::generate();
        assert_eq!(sk.key().len(), 16);
        assert_eq!(sk.iv().len(), 16);
        assert_eq!(sk.salt().len(), 8);
    }
}
