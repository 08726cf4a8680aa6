//! # device-crypto
//!
//! Cryptographic primitives for the handshake and framed transport:
//! RSA encrypt/decrypt/sign, AES-128-CBC streaming cipher/decipher pairs,
//! HMAC-SHA1, a CSPRNG boundary, and the file-backed device/server key store.

pub mod aes_stream;
pub mod error;
pub mod hmac_sha1;
pub mod keystore;
pub mod rsa_ops;
pub mod session_key;

pub use aes_stream::{CipherStream, DecipherStream};
pub use error::CryptoError;
pub use hmac_sha1::hmac_sha1;
pub use keystore::KeyStore;
pub use session_key::SessionKey;

use rand::RngCore;
use rand::rngs::OsRng;

/// Generate `n` cryptographically random bytes.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate the 40-byte handshake nonce.
pub fn random_nonce() -> [u8; 40] {
    let mut buf = [0u8; 40];
    OsRng.fill_bytes(&mut buf);
    buf
}
