//! HMAC-SHA1, used in handshake step 4 to authenticate the RSA-encrypted
//! session key before it is signed.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Compute HMAC-SHA1 of `message` keyed by `key`.
pub fn hmac_sha1(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_20_byte_digest() {
        let digest = hmac_sha1(b"key", b"message");
        assert_eq!(digest.len(), 20);
    }

    #[test]
    fn is_deterministic() {
        let a = hmac_sha1(b"key", b"message");
        let b = hmac_sha1(b"key", b"message");
        assert_eq!(a, b);
    }

    #[test]
    fn differs_with_key() {
        let a = hmac_sha1(b"key1", b"message");
        let b = hmac_sha1(b"key2", b"message");
        assert_ne!(a, b);
    }
}
