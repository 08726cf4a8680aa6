//! RSA encrypt/decrypt/sign primitives used by the handshake.
//!
//! The handshake wire format is fixed by deployed device firmware: PKCS#1
//! v1.5 padding for both encryption and signing (no OAEP/PSS), with SHA-1
//! digests for signatures. See `spec.md` §6.

use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};

use crate::error::CryptoError;

/// Generate a fresh RSA keypair for the server (1024-bit matches deployed
/// device firmware; the server itself could use a larger modulus, but tests
/// and interop both assume 1024-bit RSA throughout this protocol).
pub fn generate_keypair(bits: usize) -> Result<RsaPrivateKey, CryptoError> {
    let mut rng = rand::rngs::OsRng;
    Ok(RsaPrivateKey::new(&mut rng, bits)?)
}

/// Decrypt a PKCS#1 v1.5 encrypted blob with the given private key.
pub fn decrypt(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Ok(private_key.decrypt(Pkcs1v15Encrypt, ciphertext)?)
}

/// Encrypt a plaintext blob with PKCS#1 v1.5 padding using the given public key.
pub fn encrypt(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut rng = rand::rngs::OsRng;
    Ok(public_key.encrypt(&mut rng, Pkcs1v15Encrypt, plaintext)?)
}

/// Sign `message` with PKCS#1 v1.5 padding over its SHA-1 digest.
pub fn sign_sha1(private_key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha1::digest(message);
    Ok(private_key.sign(Pkcs1v15Sign::new::<Sha1>(), &digest)?)
}

/// Verify a PKCS#1 v1.5 / SHA-1 signature produced by [`sign_sha1`].
pub fn verify_sha1(
    public_key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let digest = Sha1::digest(message);
    Ok(public_key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)?)
}

/// Parse a device-provided public key DER blob. Device firmware emits either
/// a bare PKCS#1 `RSAPublicKey` or an X.509 `SubjectPublicKeyInfo`; try both.
pub fn public_key_from_der(der: &[u8]) -> Result<RsaPublicKey, CryptoError> {
    if let Ok(key) = RsaPublicKey::from_pkcs1_der(der) {
        return Ok(key);
    }
    Ok(RsaPublicKey::from_public_key_der(der)?)
}

/// Render a public key as PEM (SPKI, `-----BEGIN PUBLIC KEY-----`) for
/// persistence via the key store.
pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    Ok(key.to_public_key_pem(LineEnding::LF)?)
}

/// Parse a PEM-encoded public key loaded from the key store.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    Ok(RsaPublicKey::from_public_key_pem(pem)?)
}

/// Render a PKCS#1 public key PEM, used only for the rare device that ships
/// a bare PKCS#1 block rather than SPKI.
pub fn public_key_to_pkcs1_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    Ok(key.to_pkcs1_pem(LineEnding::LF)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let sk = generate_keypair(1024).unwrap();
        let pk = RsaPublicKey::from(&sk);
        let msg = b"a session key worth protecting, forty bytes!!";
        let ct = encrypt(&pk, msg).unwrap();
        let pt = decrypt(&sk, &ct).unwrap();
        assert_eq!(pt, msg);
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let sk = generate_keypair(1024).unwrap();
        let pk = RsaPublicKey::from(&sk);
        let msg = b"some ciphertext to authenticate";
        let sig = sign_sha1(&sk, msg).unwrap();
        assert!(verify_sha1(&pk, msg, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let sk = generate_keypair(1024).unwrap();
        let pk = RsaPublicKey::from(&sk);
        let sig = sign_sha1(&sk, b"original").unwrap();
        assert!(verify_sha1(&pk, b"tampered", &sig).is_err());
    }

    #[test]
    fn pem_round_trips() {
        let sk = generate_keypair(1024).unwrap();
        let pk = RsaPublicKey::from(&sk);
        let pem = public_key_to_pem(&pk).unwrap();
        let parsed = public_key_from_pem(&pem).unwrap();
        assert_eq!(pk, parsed);
    }
}
