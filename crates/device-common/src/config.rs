//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! production. Config precedence: env vars > `.env` file > `config.toml` >
//! defaults.

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call device_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code
/// accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.bind_host", "0.0.0.0")?
        .set_default("server.bind_port", 5683)?
        .set_default("server.max_connections", 100_000)?
        .set_default("handshake.global_timeout_secs", 10)?
        .set_default("handshake.read_timeout_secs", 30)?
        .set_default("handshake.chunking_enabled", true)?
        .set_default("ota.chunk_size", 256)?
        .set_default("ota.max_chunk_size", 594)?
        .set_default("ota.max_missed_chunks", 10)?
        .set_default("ota.overall_timeout_secs", 60)?
        .set_default("ota.update_ready_retry_secs", 6)?
        .set_default("ota.update_ready_retries", 3)?
        .set_default("ota.update_ready_final_timeout_secs", 90)?
        .set_default("ota.ignore_missed_chunks", false)?
        .set_default("keystore.directory", "./data/keystore")?
        .set_default("binaries.directory", "./data/binaries")?
        .set_default("pubsub.response_timeout_secs", 5)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (DEVICE_SERVER__BIND_PORT, DEVICE_OTA__CHUNK_SIZE, ...)
        .add_source(
            config::Environment::with_prefix("DEVICE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build an `AppConfig` purely from in-process defaults, bypassing the env
/// and file sources. Used by tests that want deterministic, short timeouts.
pub fn defaults_for_test() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            bind_host: "127.0.0.1".into(),
            bind_port: 0,
            max_connections: 10,
        },
        handshake: HandshakeConfig {
            global_timeout_secs: 10,
            read_timeout_secs: 30,
            chunking_enabled: true,
        },
        ota: OtaConfig {
            chunk_size: 256,
            max_chunk_size: 594,
            max_missed_chunks: 10,
            overall_timeout_secs: 60,
            update_ready_retry_secs: 6,
            update_ready_retries: 3,
            update_ready_final_timeout_secs: 90,
            ignore_missed_chunks: false,
        },
        keystore: KeyStoreConfig { directory: "./data/keystore".into() },
        binaries: BinariesConfig { directory: "./data/binaries".into() },
        pubsub: PubSubConfig { response_timeout_secs: 5 },
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub handshake: HandshakeConfig,
    pub ota: OtaConfig,
    pub keystore: KeyStoreConfig,
    pub binaries: BinariesConfig,
    pub pubsub: PubSubConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HandshakeConfig {
    pub global_timeout_secs: u64,
    pub read_timeout_secs: u64,
    /// Whether the ChunkingFramer is interposed between the socket and the
    /// AES streams. Default true; disabling is only useful for raw-stream
    /// testing.
    pub chunking_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OtaConfig {
    pub chunk_size: u16,
    pub max_chunk_size: u16,
    pub max_missed_chunks: usize,
    pub overall_timeout_secs: u64,
    pub update_ready_retry_secs: u64,
    pub update_ready_retries: u32,
    pub update_ready_final_timeout_secs: u64,
    /// If true, `ChunkMissed` messages are ignored outside fast-OTA mode.
    pub ignore_missed_chunks: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeyStoreConfig {
    /// Directory holding per-device public key PEM files and the server
    /// keypair (`server.key.pem` / `server.pub.pem`).
    pub directory: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BinariesConfig {
    /// `BINARIES_DIRECTORY` — where OTA firmware images are read from.
    pub directory: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PubSubConfig {
    pub response_timeout_secs: u64,
}
