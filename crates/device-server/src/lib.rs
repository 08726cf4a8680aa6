//! # device-server
//!
//! Accepts TCP connections from devices, runs the [`device_handshake::Handshake`]
//! state machine on each, and hands the result to [`device_session::DeviceSession`].
//! Publishes device lifecycle events (`device/connected`, `device/disconnected`)
//! onto the shared [`EventPublisher`] so upper layers (out of scope here — the
//! REST API, webhook dispatch) can react without this crate knowing they exist.

mod error;

pub use error::ServerError;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use device_common::config::AppConfig;
use device_crypto::KeyStore;
use device_events::{EventPublisher, PublishMetadata, PublishedEvent};
use device_handshake::Handshake;
use device_session::DeviceSession;
use rsa::RsaPrivateKey;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// Everything a newly accepted connection needs: the handshake state machine
/// (shared, since it only holds read-only config plus the key store/server
/// key) and the event bus to report lifecycle transitions on.
pub struct DeviceServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    handshake: Arc<Handshake>,
    events: EventPublisher,
}

impl DeviceServer {
    /// Bind the configured `server.bind_host:bind_port`, loading (or
    /// generating, on first run) the server's own RSA keypair from the
    /// configured key store directory.
    pub async fn bind(config: &AppConfig, events: EventPublisher) -> Result<Self, ServerError> {
        let addr: SocketAddr = format!("{}:{}", config.server.bind_host, config.server.bind_port)
            .parse()
            .expect("bind_host/bind_port must form a valid socket address");

        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind(addr, e))?;

        let keystore = Arc::new(KeyStore::new(config.keystore.directory.clone()));
        let server_key: RsaPrivateKey = keystore.load_or_generate_server_keypair().await?;

        let handshake = Arc::new(Handshake::new(
            keystore,
            Arc::new(server_key),
            Duration::from_secs(config.handshake.global_timeout_secs),
            Duration::from_secs(config.handshake.read_timeout_secs),
            config.handshake.chunking_enabled,
        ));

        info!(%local_addr, "device server bound");
        Ok(Self { listener, local_addr, handshake, events })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the process is asked to shut down. Each
    /// connection gets its own `tokio::spawn`ed task; a failure on one
    /// connection never affects another.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            let (socket, remote_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection, continuing");
                    continue;
                }
            };

            let handshake = self.handshake.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                handle_connection(socket, remote_addr, handshake, events).await;
            });
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    remote_addr: SocketAddr,
    handshake: Arc<Handshake>,
    events: EventPublisher,
) {
    let _ = socket.set_nodelay(true);
    let connection_key = format!("conn-{}", uuid::Uuid::new_v4());

    let output = match handshake.run(socket).await {
        Ok(output) => output,
        Err(e) => {
            warn!(%connection_key, %remote_addr, error = %e, "handshake failed");
            return;
        }
    };

    let device_id = output.device_id;
    info!(%connection_key, %remote_addr, device = %device_id, "handshake complete");

    let (session, join_handle) = DeviceSession::spawn(output, connection_key.clone());
    events.publish(
        PublishedEvent::new("device/connected")
            .with_device_id(device_id)
            .with_connection_id(connection_key.clone())
            .with_context(serde_json::json!({ "remoteAddr": remote_addr.to_string() })),
        PublishMetadata::private().internal(),
    );

    let cause = join_handle.await.unwrap_or_else(|e| {
        error!(%connection_key, error = %e, "session task panicked");
        device_session::DisconnectCause::Protocol("session task panicked".into())
    });

    info!(%connection_key, device = %device_id, ?cause, "session ended");
    drop(session);
    events.publish(
        PublishedEvent::new("device/disconnected")
            .with_device_id(device_id)
            .with_connection_id(connection_key)
            .with_context(serde_json::json!({ "cause": format!("{cause:?}") })),
        PublishMetadata::private().internal(),
    );
}
