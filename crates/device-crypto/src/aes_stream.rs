//! AES-128-CBC cipher/decipher stream pair.
//!
//! Unlike a typical one-shot CBC helper, these streams chain across calls:
//! the last ciphertext block of one `encrypt`/`decrypt` call becomes the
//! implicit IV for the next. This matches the wire protocol, where the
//! session's AES state persists for the whole connection rather than being
//! re-initialized per CoAP message — only the very first message uses the
//! handshake-derived IV.

use aes::Aes128;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use generic_array::GenericArray;

use crate::error::CryptoError;

const BLOCK_SIZE: usize = 16;

/// Outbound (server→device) AES-128-CBC encryption stream.
pub struct CipherStream {
    cipher: Aes128,
    prev_block: [u8; BLOCK_SIZE],
}

impl CipherStream {
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self { cipher: Aes128::new(GenericArray::from_slice(key)), prev_block: *iv }
    }

    /// PKCS7-pad and encrypt `plaintext`, chaining off the running IV state.
    /// Returns ciphertext whose length is always a multiple of 16.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let padded = pkcs7_pad(plaintext);
        let mut out = Vec::with_capacity(padded.len());

        for chunk in padded.chunks(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            for i in 0..BLOCK_SIZE {
                block[i] = chunk[i] ^ self.prev_block[i];
            }
            let mut ga = GenericArray::from(block);
            self.cipher.encrypt_block(&mut ga);
            self.prev_block.copy_from_slice(&ga);
            out.extend_from_slice(&ga);
        }
        out
    }
}

/// Inbound (device→server) AES-128-CBC decryption stream.
pub struct DecipherStream {
    cipher: Aes128,
    prev_block: [u8; BLOCK_SIZE],
}

impl DecipherStream {
    pub fn new(key: &[u8; 16], iv: &[u8; 16]) -> Self {
        Self { cipher: Aes128::new(GenericArray::from_slice(key)), prev_block: *iv }
    }

    /// Decrypt a complete ciphertext frame, chaining off the running IV
    /// state, and strip PKCS7 padding. `ciphertext.len()` must be a
    /// non-zero multiple of 16.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::UnalignedCiphertext(ciphertext.len()));
        }

        let mut out = Vec::with_capacity(ciphertext.len());
        for chunk in ciphertext.chunks(BLOCK_SIZE) {
            let mut ga = GenericArray::clone_from_slice(chunk);
            self.cipher.decrypt_block(&mut ga);
            let mut plain = [0u8; BLOCK_SIZE];
            for i in 0..BLOCK_SIZE {
                plain[i] = ga[i] ^ self.prev_block[i];
            }
            self.prev_block.copy_from_slice(chunk);
            out.extend_from_slice(&plain);
        }

        pkcs7_unpad(&out)
    }
}

fn pkcs7_pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad_len as u8).take(pad_len));
    out
}

fn pkcs7_unpad(data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let pad_len = *data.last().ok_or(CryptoError::BadPadding)? as usize;
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > data.len() {
        return Err(CryptoError::BadPadding);
    }
    if !data[data.len() - pad_len..].iter().all(|&b| b as usize == pad_len) {
        return Err(CryptoError::BadPadding);
    }
    Ok(data[..data.len() - pad_len].to_vec())
}
