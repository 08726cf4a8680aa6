//! File-backed device public-key store and server keypair.
//!
//! One PEM file per device (`<device_id_hex>.pub.pem`) under
//! `keystore.directory`, plus a single server keypair
//! (`server.key.pem` / `server.pub.pem`) generated on first run. An
//! in-memory cache avoids re-reading disk for devices seen earlier in the
//! process lifetime — mirroring the "load active key from storage, cache it,
//! generate-and-persist on miss" shape the rest of this codebase uses for
//! its other long-lived credentials.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use device_common::DeviceId;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::CryptoError;
use crate::rsa_ops;

const SERVER_KEY_BITS: usize = 2048;

/// Handle to the device public-key store and this server's own RSA keypair.
#[derive(Clone)]
pub struct KeyStore {
    directory: PathBuf,
    cache: Arc<RwLock<HashMap<DeviceId, RsaPublicKey>>>,
}

impl KeyStore {
    /// Open (without touching disk yet) a key store rooted at `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into(), cache: Arc::new(RwLock::new(HashMap::new())) }
    }

    fn device_key_path(&self, id: &DeviceId) -> PathBuf {
        self.directory.join(format!("{}.pub.pem", id.to_hex()))
    }

    fn server_private_key_path(&self) -> PathBuf {
        self.directory.join("server.key.pem")
    }

    fn server_public_key_path(&self) -> PathBuf {
        self.directory.join("server.pub.pem")
    }

    /// Look up a device's public key: in-memory cache, then disk, then `None`.
    pub async fn get_core_key(&self, id: &DeviceId) -> Result<Option<RsaPublicKey>, CryptoError> {
        if let Some(key) = self.cache.read().await.get(id) {
            return Ok(Some(key.clone()));
        }

        let path = self.device_key_path(id);
        if !path.exists() {
            return Ok(None);
        }

        let pem = tokio::fs::read_to_string(&path).await?;
        let key = rsa_ops::public_key_from_pem(&pem)?;
        self.cache.write().await.insert(*id, key.clone());
        Ok(Some(key))
    }

    /// Persist a newly-learned device public key (handshake step 2: a
    /// first-contact device appends its DER-encoded public key to the
    /// decrypted payload).
    pub async fn save_handshake_key(
        &self,
        id: &DeviceId,
        key: &RsaPublicKey,
    ) -> Result<(), CryptoError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let pem = rsa_ops::public_key_to_pem(key)?;
        tokio::fs::write(self.device_key_path(id), pem).await?;
        self.cache.write().await.insert(*id, key.clone());
        info!(device = %id, "persisted device public key learned in-band during handshake");
        Ok(())
    }

    /// Load this server's RSA keypair from disk, generating and persisting a
    /// fresh one if absent (first run).
    pub async fn load_or_generate_server_keypair(&self) -> Result<RsaPrivateKey, CryptoError> {
        let priv_path = self.server_private_key_path();
        let pub_path = self.server_public_key_path();

        if priv_path.exists() {
            let pem = tokio::fs::read_to_string(&priv_path).await?;
            let key = rsa_key_from_pkcs8_pem(&pem)?;
            info!("loaded existing server RSA keypair");
            return Ok(key);
        }

        warn!("no server RSA keypair found — generating a new one");
        let private_key = rsa_ops::generate_keypair(SERVER_KEY_BITS)?;
        let public_key = RsaPublicKey::from(&private_key);

        tokio::fs::create_dir_all(&self.directory).await?;
        tokio::fs::write(&priv_path, rsa_private_key_to_pkcs8_pem(&private_key)?).await?;
        tokio::fs::write(&pub_path, rsa_ops::public_key_to_pem(&public_key)?).await?;
        info!("generated and persisted new server RSA keypair");
        Ok(private_key)
    }

    /// Directory this store is rooted at, for diagnostics.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

fn rsa_private_key_to_pkcs8_pem(key: &RsaPrivateKey) -> Result<String, CryptoError> {
    use rsa::pkcs8::EncodePrivateKey;
    Ok(key.to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)?.to_string())
}

fn rsa_key_from_pkcs8_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    use rsa::pkcs8::DecodePrivateKey;
    Ok(RsaPrivateKey::from_pkcs8_pem(pem)?)
}
