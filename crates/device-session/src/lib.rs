//! The post-handshake session: owns the framed encrypted socket, dispatches
//! inbound `CoapMessage`s by symbolic name, tracks message counters, and
//! enforces single-owner write exclusion.
//!
//! The actor pattern below — a `tokio::spawn`ed task owning all mutable
//! connection state, driven by an `mpsc` command channel — mirrors the
//! per-room task in the voice SFU: one task per live connection, command
//! messages carry their own reply channel, and state never crosses a task
//! boundary except through that channel.

mod error;

pub use error::SessionError;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use device_common::DeviceId;
use device_crypto::CipherStream;
use device_handshake::HandshakeOutput;
use device_wire::{CoapMessage, CoapOption, CoapType, Conn, MessageName, WireError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A subscriber on the session's internal event bus (distinct from the
/// process-wide `device-events` publisher).
pub type EventHandler = Arc<dyn Fn(CoapMessage) + Send + Sync>;

#[derive(Clone)]
struct Matcher {
    name: MessageName,
    uri: Option<String>,
    token: Option<Vec<u8>>,
}

impl Matcher {
    /// Several ack-shaped responses (`ChunkReceived`, `UpdateDone`,
    /// `ChunkMissedAck`, ...) share the same CoAP code and carry no URI
    /// path, so they cannot be told apart from the wire bytes alone —
    /// exactly as in plain CoAP, where an ACK is correlated to its request
    /// by token, not by restating what it's a response to. When a token
    /// was supplied (the normal case: every `send_message` assigns one),
    /// it alone decides the match. Only requests awaited without a token
    /// (`UpdateReady` vs `UpdateAbort`, which do have distinct codes) fall
    /// back to matching by code/type/URI.
    fn matches(&self, msg: &CoapMessage) -> bool {
        if let Some(token) = &self.token {
            return &msg.token == token && msg.mtype == CoapType::Ack;
        }
        if msg.code != self.name.code() || msg.mtype != self.name.coap_type() {
            return false;
        }
        if let Some(uri) = &self.uri {
            if msg.uri_path().as_deref() != Some(uri.as_str()) {
                return false;
            }
        }
        true
    }
}

enum Command {
    Send {
        message: CoapMessage,
        owner: Option<String>,
        reply: oneshot::Sender<Result<(bool, Vec<u8>), SessionError>>,
    },
    TakeOwnership {
        owner: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    ReleaseOwnership {
        owner: String,
    },
    ListenFor {
        matcher: Matcher,
        reply: oneshot::Sender<CoapMessage>,
    },
    On {
        event_name: String,
        handler: EventHandler,
    },
}

/// Why the dispatch loop ended. Surfaced to whoever holds the `JoinHandle`
/// returned by [`DeviceSession::spawn`] so the caller can emit a
/// `disconnect` event with a cause.
#[derive(Debug, Clone)]
pub enum DisconnectCause {
    SocketClosed,
    Protocol(String),
}

/// Ceiling on a single decrypted CoAP message, independent of
/// `device_wire`'s `MAX_FRAME_LEN`. The wire layer bounds the *ciphertext*
/// frame; this bounds the *plaintext* message a device is allowed to send
/// once a session is established, well below the wire cap, so a device
/// can't use the full frame budget to smuggle an oversized CoAP message.
const MAX_COAP_MESSAGE_LEN: usize = 2048;

/// Handle to a live device session. Cheaply `Clone`-able; every clone talks
/// to the same dispatch task over its command channel.
#[derive(Clone)]
pub struct DeviceSession {
    id: DeviceId,
    connection_key: Arc<str>,
    cmd_tx: mpsc::Sender<Command>,
}

impl DeviceSession {
    /// Hand off a completed handshake to a freshly spawned dispatch task.
    /// Returns the session handle plus a `JoinHandle` resolving to the
    /// reason the session eventually closed.
    pub fn spawn<T>(
        output: HandshakeOutput<T>,
        connection_key: impl Into<Arc<str>>,
    ) -> (Self, JoinHandle<DisconnectCause>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let id = output.device_id;
        let connection_key = connection_key.into();

        let handle = tokio::spawn(run_actor(output, cmd_rx, connection_key.clone()));

        (Self { id, connection_key, cmd_tx }, handle)
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn connection_key(&self) -> &str {
        &self.connection_key
    }

    /// Serialise, encrypt, frame, and write `name` with the given extra
    /// options (e.g. OTA's CRC/index `URI_QUERY`s) and payload. Returns
    /// `false` without writing if `owner` does not hold (or match) the
    /// current write-exclusive owner.
    ///
    /// Every sent message is assigned a fresh token, returned alongside the
    /// send result, so a caller that needs to correlate an ack-shaped reply
    /// (e.g. `ChunkReceived`, which shares its CoAP code with several other
    /// ack messages) can `listen_for` by that exact token.
    pub async fn send_message(
        &self,
        name: MessageName,
        options: Vec<CoapOption>,
        payload: Vec<u8>,
        owner: Option<String>,
    ) -> Result<(bool, Vec<u8>), SessionError> {
        let mut message = CoapMessage::new(name.coap_type(), name.code(), 0).with_payload(payload);
        if let Some(path) = name.uri_path() {
            message = message.with_option(CoapOption::uri_path(path));
        }
        for option in options {
            message = message.with_option(option);
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { message, owner, reply })
            .await
            .map_err(|_| SessionError::TaskGone)?;
        rx.await.map_err(|_| SessionError::TaskGone)?
    }

    /// Reply to a specific inbound message by CoAP token, e.g. acking a
    /// `ChunkMissed` with `ChunkMissedAck`.
    pub async fn send_reply(
        &self,
        name: MessageName,
        token: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<bool, SessionError> {
        let mut message = CoapMessage::new(name.coap_type(), name.code(), 0)
            .with_token(token)
            .with_payload(payload);
        if let Some(path) = name.uri_path() {
            message = message.with_option(CoapOption::uri_path(path));
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { message, owner: None, reply })
            .await
            .map_err(|_| SessionError::TaskGone)?;
        rx.await.map_err(|_| SessionError::TaskGone)?.map(|(sent, _)| sent)
    }

    /// One-shot wait for the next inbound message matching `name` (and,
    /// optionally, `uri`/`token`). Multiple concurrent calls are allowed;
    /// the first matching inbound message resolves the earliest-registered
    /// matching listener.
    pub async fn listen_for(
        &self,
        name: MessageName,
        uri: Option<String>,
        token: Option<Vec<u8>>,
    ) -> Result<CoapMessage, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ListenFor { matcher: Matcher { name, uri, token }, reply })
            .await
            .map_err(|_| SessionError::TaskGone)?;
        rx.await.map_err(|_| SessionError::TaskGone)
    }

    /// Claim exclusive write rights. Fails if another owner already holds
    /// them.
    pub async fn take_ownership(&self, owner: impl Into<String>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::TakeOwnership { owner: owner.into(), reply })
            .await
            .map_err(|_| SessionError::TaskGone)?;
        rx.await.map_err(|_| SessionError::TaskGone)?
    }

    pub async fn release_ownership(&self, owner: impl Into<String>) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::ReleaseOwnership { owner: owner.into() })
            .await
            .map_err(|_| SessionError::TaskGone)
    }

    /// Subscribe a handler on the session's internal event bus. Event names
    /// follow `msg_<lowercase symbolic name>`, e.g. `msg_chunkmissed`.
    pub async fn on(&self, event_name: impl Into<String>, handler: EventHandler) -> Result<(), SessionError> {
        self.cmd_tx
            .send(Command::On { event_name: event_name.into(), handler })
            .await
            .map_err(|_| SessionError::TaskGone)
    }
}

/// Canonical internal event bus key for a symbolic message name.
pub fn event_key(name: MessageName) -> String {
    format!("msg_{}", format!("{name:?}").to_lowercase())
}

enum Inbound {
    FromQueue(Vec<u8>),
    FromSocket(Option<Vec<u8>>),
}

async fn next_inbound<T>(
    queue: &mut VecDeque<Vec<u8>>,
    conn: &mut Conn<T>,
) -> Result<Inbound, WireError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(buf) = queue.pop_front() {
        return Ok(Inbound::FromQueue(buf));
    }
    Ok(Inbound::FromSocket(conn.read_frame().await?))
}

async fn run_actor<T>(
    output: HandshakeOutput<T>,
    mut cmd_rx: mpsc::Receiver<Command>,
    connection_key: Arc<str>,
) -> DisconnectCause
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let HandshakeOutput {
        device_id,
        mut cipher,
        mut decipher,
        session_key,
        pending_buffers,
        server_initial_counter,
        mut conn,
        ..
    } = output;

    let mut expected_counter = session_key.initial_counter();
    let mut out_counter = server_initial_counter;
    let mut out_message_id: u16 = 0;
    let mut owner: Option<String> = None;
    let mut listeners: Vec<(Matcher, oneshot::Sender<CoapMessage>)> = Vec::new();
    let mut handlers: HashMap<String, Vec<EventHandler>> = HashMap::new();
    let mut queue: VecDeque<Vec<u8>> = pending_buffers.into_iter().collect();

    info!(device = %device_id, %connection_key, "session started");

    loop {
        tokio::select! {
            biased;

            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(cmd) => {
                        handle_command(
                            cmd,
                            &mut conn,
                            &mut cipher,
                            &mut owner,
                            &mut listeners,
                            &mut handlers,
                            &mut out_counter,
                            &mut out_message_id,
                        )
                        .await;
                    }
                    None => {
                        info!(device = %device_id, "session ending: all handles dropped");
                        return DisconnectCause::SocketClosed;
                    }
                }
            }

            inbound = next_inbound(&mut queue, &mut conn) => {
                match inbound {
                    Ok(Inbound::FromQueue(bytes)) => {
                        if let Err(e) = dispatch_decrypted(bytes, &mut expected_counter, &mut listeners, &handlers).await {
                            warn!(device = %device_id, error = %e, "queued message rejected, closing session");
                            return DisconnectCause::Protocol(format!("handshake carry-over queue: {e}"));
                        }
                    }
                    Ok(Inbound::FromSocket(Some(raw))) => {
                        match decipher.decrypt(&raw) {
                            Ok(bytes) => {
                                if let Err(e) = dispatch_decrypted(bytes, &mut expected_counter, &mut listeners, &handlers).await {
                                    warn!(device = %device_id, error = %e, "CoAP frame rejected, closing session");
                                    return DisconnectCause::Protocol(format!("{e}"));
                                }
                            }
                            Err(e) => {
                                warn!(device = %device_id, error = %e, "decrypt failure, counter desynchronised, closing session");
                                return DisconnectCause::Protocol(format!("decrypt failure: {e}"));
                            }
                        }
                    }
                    Ok(Inbound::FromSocket(None)) => {
                        info!(device = %device_id, "socket closed by peer");
                        return DisconnectCause::SocketClosed;
                    }
                    Err(e) => {
                        warn!(device = %device_id, error = %e, "socket error, closing session");
                        return DisconnectCause::Protocol(format!("socket error: {e}"));
                    }
                }
            }
        }
    }
}

/// Decode and dispatch one decrypted frame, advancing `expected_counter`.
/// Returns `Err` on an oversized or malformed frame (caller closes the
/// session).
async fn dispatch_decrypted(
    bytes: Vec<u8>,
    expected_counter: &mut u32,
    listeners: &mut Vec<(Matcher, oneshot::Sender<CoapMessage>)>,
    handlers: &HashMap<String, Vec<EventHandler>>,
) -> Result<(), SessionError> {
    if bytes.len() > MAX_COAP_MESSAGE_LEN {
        return Err(SessionError::FrameOversize);
    }

    let msg = CoapMessage::decode(&bytes)?;

    *expected_counter = expected_counter.wrapping_add(1);

    if let Some(name) = MessageName::recognize(&msg) {
        if let Some(pos) = listeners.iter().position(|(m, _)| m.matches(&msg)) {
            let (_, tx) = listeners.remove(pos);
            let _ = tx.send(msg.clone());
        }

        if let Some(hs) = handlers.get(&event_key(name)) {
            for handler in hs {
                handler(msg.clone());
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_command<T>(
    cmd: Command,
    conn: &mut Conn<T>,
    cipher: &mut CipherStream,
    owner: &mut Option<String>,
    listeners: &mut Vec<(Matcher, oneshot::Sender<CoapMessage>)>,
    handlers: &mut HashMap<String, Vec<EventHandler>>,
    out_counter: &mut u32,
    out_message_id: &mut u16,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match cmd {
        Command::Send { mut message, owner: sender_owner, reply } => {
            if let Some(current) = owner.as_ref() {
                if Some(current) != sender_owner.as_ref() {
                    let _ = reply.send(Ok((false, Vec::new())));
                    return;
                }
            }

            message.message_id = *out_message_id;
            // Every outbound message gets a fresh token derived from its
            // message id unless the caller already supplied one (replies to
            // a specific inbound token, e.g. `send_reply`), so ack-shaped
            // responses that share a CoAP code can still be correlated by
            // `DeviceSession::listen_for`.
            if message.token.is_empty() {
                message.token = out_message_id.to_be_bytes().to_vec();
            }
            let token = message.token.clone();

            match message.encode() {
                Ok(encoded) => {
                    let encrypted = cipher.encrypt(&encoded);
                    match conn.write_frame(encrypted).await {
                        Ok(()) => {
                            *out_message_id = out_message_id.wrapping_add(1);
                            *out_counter = out_counter.wrapping_add(1);
                            let _ = reply.send(Ok((true, token)));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e.into()));
                        }
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                }
            }
        }
        Command::TakeOwnership { owner: requested, reply } => {
            if owner.is_some() && owner.as_deref() != Some(requested.as_str()) {
                let _ = reply.send(Err(SessionError::NotOwner));
            } else {
                *owner = Some(requested);
                let _ = reply.send(Ok(()));
            }
        }
        Command::ReleaseOwnership { owner: requester } => {
            if owner.as_deref() == Some(requester.as_str()) {
                *owner = None;
            }
        }
        Command::ListenFor { matcher, reply } => {
            listeners.push((matcher, reply));
        }
        Command::On { event_name, handler } => {
            handlers.entry(event_name).or_default().push(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use device_crypto::{DecipherStream, SessionKey};
    use device_wire::ChunkCodec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_util::codec::{Decoder, Encoder};

    fn handshake_output_over(
        server_io: DuplexStream,
        session_key: &SessionKey,
        pending_buffers: Vec<Vec<u8>>,
    ) -> HandshakeOutput<DuplexStream> {
        let cipher = CipherStream::new(session_key.key(), session_key.iv());
        let decipher = device_crypto::DecipherStream::new(session_key.key(), session_key.iv());
        HandshakeOutput {
            device_id: DeviceId::from_bytes(&[1; 12]).unwrap(),
            cipher,
            decipher,
            session_key: session_key.clone(),
            handshake_buffer: Vec::new(),
            pending_buffers,
            server_initial_counter: 0,
            conn: Conn::chunked(server_io),
        }
    }

    async fn read_one_frame(io: &mut DuplexStream) -> Vec<u8> {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        let mut scratch = [0u8; 512];
        loop {
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                return frame;
            }
            let n = io.read(&mut scratch).await.unwrap();
            assert!(n > 0, "peer closed before a full frame arrived");
            buf.extend_from_slice(&scratch[..n]);
        }
    }

    async fn write_encrypted_frame(io: &mut DuplexStream, cipher: &mut CipherStream, msg: &CoapMessage) {
        let encrypted = cipher.encrypt(&msg.encode().unwrap());
        let mut codec = ChunkCodec::new();
        let mut wire = BytesMut::new();
        Encoder::<Vec<u8>>::encode(&mut codec, encrypted, &mut wire).unwrap();
        io.write_all(&wire).await.unwrap();
    }

    #[tokio::test]
    async fn send_message_round_trips_to_device_socket() {
        let session_key = SessionKey::from_bytes([9u8; 40]);
        let (server_io, mut client_io) = duplex(8192);

        let output = handshake_output_over(server_io, &session_key, Vec::new());
        let (session, _handle) = DeviceSession::spawn(output, "conn-1".to_string());

        let (sent, token) = session
            .send_message(MessageName::Describe, Vec::new(), b"hi".to_vec(), None)
            .await
            .unwrap();
        assert!(sent);
        assert!(!token.is_empty());

        let mut client_decipher = DecipherStream::new(session_key.key(), session_key.iv());
        let frame = read_one_frame(&mut client_io).await;
        let decrypted = client_decipher.decrypt(&frame).unwrap();
        let msg = CoapMessage::decode(&decrypted).unwrap();
        assert_eq!(MessageName::recognize(&msg), Some(MessageName::Describe));
        assert_eq!(msg.payload, b"hi");
    }

    #[tokio::test]
    async fn listen_for_resolves_on_matching_dispatch() {
        let session_key = SessionKey::from_bytes([3u8; 40]);
        let (server_io, mut client_io) = duplex(8192);
        let mut device_cipher = CipherStream::new(session_key.key(), session_key.iv());

        let output = handshake_output_over(server_io, &session_key, Vec::new());
        let (session, _handle) = DeviceSession::spawn(output, "conn-2".to_string());

        let listen = tokio::spawn({
            let session = session.clone();
            async move { session.listen_for(MessageName::ChunkReceived, None, None).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let chunk_ack = CoapMessage::new(CoapType::Ack, MessageName::ChunkReceived.code(), 1);
        write_encrypted_frame(&mut client_io, &mut device_cipher, &chunk_ack).await;

        let resolved = tokio::time::timeout(Duration::from_millis(200), listen)
            .await
            .expect("listener timed out")
            .unwrap()
            .unwrap();
        // ChunkReceived shares its code/type/no-path shape with several other
        // acks (see Matcher::matches), so identity here is by code, not by
        // `MessageName::recognize`, which cannot disambiguate them.
        assert_eq!(resolved.code, MessageName::ChunkReceived.code());
    }

    #[tokio::test]
    async fn ownership_is_exclusive() {
        let session_key = SessionKey::from_bytes([5u8; 40]);
        let (server_io, _client_io) = duplex(8192);
        let output = handshake_output_over(server_io, &session_key, Vec::new());
        let (session, _handle) = DeviceSession::spawn(output, "conn-3".to_string());

        session.take_ownership("flasher").await.unwrap();
        let result = session.take_ownership("other").await;
        assert!(matches!(result, Err(SessionError::NotOwner)));

        session.release_ownership("flasher").await.unwrap();
        session.take_ownership("other").await.unwrap();
    }

    #[tokio::test]
    async fn on_handler_fires_for_internal_chunk_missed_event() {
        let session_key = SessionKey::from_bytes([6u8; 40]);
        let (server_io, mut client_io) = duplex(8192);
        let mut device_cipher = CipherStream::new(session_key.key(), session_key.iv());

        let output = handshake_output_over(server_io, &session_key, Vec::new());
        let (session, _handle) = DeviceSession::spawn(output, "conn-4".to_string());

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        session
            .on(event_key(MessageName::ChunkMissed), Arc::new(move |_msg| {
                count2.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();

        let missed = CoapMessage::new(MessageName::ChunkMissed.coap_type(), MessageName::ChunkMissed.code(), 1)
            .with_option(CoapOption::uri_path("c"))
            .with_payload(vec![0x00, 0x02]);
        write_encrypted_frame(&mut client_io, &mut device_cipher, &missed).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_buffers_are_replayed_before_live_reads() {
        let session_key = SessionKey::from_bytes([7u8; 40]);
        let (server_io, _client_io) = duplex(8192);

        let mut handshake_decipher = DecipherStream::new(session_key.key(), session_key.iv());
        let mut handshake_cipher_for_device = CipherStream::new(session_key.key(), session_key.iv());
        let describe = CoapMessage::new(CoapType::Con, MessageName::Describe.code(), 1)
            .with_option(CoapOption::uri_path("d"));
        let encrypted = handshake_cipher_for_device.encrypt(&describe.encode().unwrap());
        let decrypted = handshake_decipher.decrypt(&encrypted).unwrap();

        let output = handshake_output_over(server_io, &session_key, vec![decrypted]);
        let (session, _handle) = DeviceSession::spawn(output, "conn-5".to_string());

        let resolved = tokio::time::timeout(
            Duration::from_millis(200),
            session.listen_for(MessageName::Describe, None, None),
        )
        .await
        .expect("listener timed out")
        .unwrap();

        assert_eq!(MessageName::recognize(&resolved), Some(MessageName::Describe));
    }
}
