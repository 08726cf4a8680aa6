//! The per-connection RSA+AES handshake: `send-nonce -> read-core-id ->
//! get-core-key -> send-session-key -> send-hello -> done`.

mod error;

pub use error::HandshakeError;

use std::sync::Arc;
use std::time::Duration;

use device_common::DeviceId;
use device_crypto::{hmac_sha1, rsa_ops, CipherStream, DecipherStream, KeyStore, SessionKey};
use device_wire::{CoapMessage, Conn, MessageName};
use rsa::RsaPrivateKey;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

const NONCE_LEN: usize = 40;
const CORE_ID_CIPHERTEXT_LEN: usize = 256;
const MIN_DECRYPTED_PAYLOAD_LEN: usize = NONCE_LEN + 12;

/// Everything the session layer needs to pick up where the handshake left
/// off: the verified device identity, the established cipher/decipher
/// streams, and the connection itself (already wrapped per the negotiated
/// [`device_wire::Transport`]).
pub struct HandshakeOutput<T> {
    pub device_id: DeviceId,
    pub cipher: CipherStream,
    pub decipher: DecipherStream,
    pub session_key: SessionKey,
    /// Decrypted bytes of the device's first (`Hello`) message.
    pub handshake_buffer: Vec<u8>,
    /// Decrypted frames that arrived immediately after `Hello`, in arrival
    /// order, not yet consumed by anyone — handed to the session exactly
    /// once at this transition.
    pub pending_buffers: Vec<Vec<u8>>,
    /// The server's own outbound CoAP message counter, seeded at a random
    /// value when the server sent its half of the `Hello` exchange (spec
    /// §4.2: "the server→device counter is initialised from the random
    /// Hello it sends").
    pub server_initial_counter: u32,
    pub conn: Conn<T>,
}

/// Configuration and shared state the handshake needs across every
/// connection: the server's own keypair and the device key store.
pub struct Handshake {
    keystore: Arc<KeyStore>,
    server_key: Arc<RsaPrivateKey>,
    global_timeout: Duration,
    read_timeout: Duration,
    chunking_enabled: bool,
}

impl Handshake {
    pub fn new(
        keystore: Arc<KeyStore>,
        server_key: Arc<RsaPrivateKey>,
        global_timeout: Duration,
        read_timeout: Duration,
        chunking_enabled: bool,
    ) -> Self {
        Self { keystore, server_key, global_timeout, read_timeout, chunking_enabled }
    }

    /// Run the full state machine against a freshly accepted socket (or, in
    /// tests, any `AsyncRead + AsyncWrite` duplex).
    pub async fn run<T>(&self, io: T) -> Result<HandshakeOutput<T>, HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.global_timeout, self.run_stages(io)).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::HandshakeTimeout),
        }
    }

    async fn run_stages<T>(&self, mut io: T) -> Result<HandshakeOutput<T>, HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let nonce = self.send_nonce(&mut io).await?;
        debug!("handshake: nonce sent");

        let (device_id, offered_key_der) = self.read_core_id(&mut io, &nonce).await?;
        info!(device = %device_id, "handshake: core id received");

        let device_key = self.get_core_key(&device_id, offered_key_der).await?;
        debug!(device = %device_id, "handshake: device key resolved");

        let session_key = self.send_session_key(&mut io, &device_key).await?;
        debug!(device = %device_id, "handshake: session key sent");

        let mut cipher = CipherStream::new(session_key.key(), session_key.iv());
        let decipher = DecipherStream::new(session_key.key(), session_key.iv());

        let mut conn = if self.chunking_enabled { Conn::chunked(io) } else { Conn::raw(io) };

        let server_initial_counter = self.send_server_hello(&mut conn, &mut cipher).await?;
        debug!(device = %device_id, "handshake: server hello sent, counter seeded at {server_initial_counter}");

        let (handshake_buffer, pending_buffers, conn, decipher) =
            self.send_hello(conn, decipher).await?;
        info!(device = %device_id, "handshake: complete");

        Ok(HandshakeOutput {
            device_id,
            cipher,
            decipher,
            session_key,
            handshake_buffer,
            pending_buffers,
            server_initial_counter,
            conn,
        })
    }

    /// Send the server's half of the `Hello` exchange: a CoAP `Hello`
    /// message whose 4-byte payload is the server's freshly chosen
    /// outbound counter seed.
    async fn send_server_hello<T>(
        &self,
        conn: &mut Conn<T>,
        cipher: &mut CipherStream,
    ) -> Result<u32, HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let seed_bytes = device_crypto::random_bytes(4);
        let seed = u32::from_be_bytes([seed_bytes[0], seed_bytes[1], seed_bytes[2], seed_bytes[3]]);

        let hello = CoapMessage::new(MessageName::Hello.coap_type(), MessageName::Hello.code(), 0)
            .with_payload(seed_bytes);
        let encrypted = cipher.encrypt(&hello.encode()?);
        conn.write_frame(encrypted).await?;

        Ok(seed)
    }

    async fn send_nonce<T>(&self, io: &mut T) -> Result<[u8; NONCE_LEN], HandshakeError>
    where
        T: AsyncWrite + Unpin,
    {
        let nonce_vec = device_crypto::random_bytes(NONCE_LEN);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_vec);
        io.write_all(&nonce).await?;
        Ok(nonce)
    }

    async fn read_core_id<T>(
        &self,
        io: &mut T,
        nonce: &[u8; NONCE_LEN],
    ) -> Result<(DeviceId, Option<Vec<u8>>), HandshakeError>
    where
        T: AsyncRead + Unpin,
    {
        let mut ciphertext = vec![0u8; CORE_ID_CIPHERTEXT_LEN];
        tokio::time::timeout(self.read_timeout, io.read_exact(&mut ciphertext))
            .await
            .map_err(|_| HandshakeError::HandshakeTimeout)??;

        let plaintext = rsa_ops::decrypt(&self.server_key, &ciphertext)?;

        if plaintext.len() < MIN_DECRYPTED_PAYLOAD_LEN {
            return Err(HandshakeError::HandshakeShortPayload(plaintext.len()));
        }
        if &plaintext[0..NONCE_LEN] != nonce.as_slice() {
            return Err(HandshakeError::HandshakeNonceMismatch);
        }

        let device_id = DeviceId::from_bytes(&plaintext[NONCE_LEN..NONCE_LEN + 12])
            .map_err(|_| HandshakeError::HandshakeShortPayload(plaintext.len()))?;

        let offered_key_der = if plaintext.len() > MIN_DECRYPTED_PAYLOAD_LEN {
            Some(plaintext[MIN_DECRYPTED_PAYLOAD_LEN..].to_vec())
        } else {
            None
        };

        Ok((device_id, offered_key_der))
    }

    async fn get_core_key(
        &self,
        device_id: &DeviceId,
        offered_key_der: Option<Vec<u8>>,
    ) -> Result<rsa::RsaPublicKey, HandshakeError> {
        if let Some(der) = offered_key_der {
            let key = rsa_ops::public_key_from_der(&der)?;
            self.keystore.save_handshake_key(device_id, &key).await?;
            return Ok(key);
        }

        self.keystore
            .get_core_key(device_id)
            .await?
            .ok_or(HandshakeError::HandshakeUnknownDevice)
    }

    async fn send_session_key<T>(
        &self,
        io: &mut T,
        device_key: &rsa::RsaPublicKey,
    ) -> Result<SessionKey, HandshakeError>
    where
        T: AsyncWrite + Unpin,
    {
        let session_key = SessionKey::generate();

        let ciphertext = rsa_ops::encrypt(device_key, session_key.as_bytes())?;
        let mac = hmac_sha1(session_key.as_bytes(), &ciphertext);
        let signature = rsa_ops::sign_sha1(&self.server_key, &mac)?;

        let mut frame = Vec::with_capacity(ciphertext.len() + signature.len());
        frame.extend_from_slice(&ciphertext);
        frame.extend_from_slice(&signature);
        io.write_all(&frame).await?;

        Ok(session_key)
    }

    /// Wait for the device's `Hello`, draining any frames that arrive in
    /// the same burst immediately after it into `pending_buffers` for the
    /// session layer to replay in order.
    async fn send_hello<T>(
        &self,
        mut conn: Conn<T>,
        mut decipher: DecipherStream,
    ) -> Result<(Vec<u8>, Vec<Vec<u8>>, Conn<T>, DecipherStream), HandshakeError>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let first = tokio::time::timeout(self.read_timeout, conn.read_frame())
            .await
            .map_err(|_| HandshakeError::HandshakeTimeout)??
            .ok_or(HandshakeError::HandshakeExpectedHello)?;

        let handshake_buffer = decipher.decrypt(&first)?;

        let mut pending_buffers = Vec::new();
        const DRAIN_GRACE: Duration = Duration::from_millis(50);
        loop {
            match tokio::time::timeout(DRAIN_GRACE, conn.read_frame()).await {
                Ok(Ok(Some(frame))) => pending_buffers.push(decipher.decrypt(&frame)?),
                _ => break,
            }
        }

        Ok((handshake_buffer, pending_buffers, conn, decipher))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use device_crypto::rsa_ops as rops;
    use rsa::RsaPublicKey;
    use std::path::PathBuf;
    use tokio::io::duplex;

    fn test_keystore() -> (Arc<KeyStore>, PathBuf) {
        let dir = std::env::temp_dir().join(format!("device-handshake-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        (Arc::new(KeyStore::new(&dir)), dir)
    }

    async fn run_device_side(
        mut client: impl AsyncRead + AsyncWrite + Unpin,
        device_id: [u8; 12],
        device_private: &RsaPrivateKey,
        server_public: &RsaPublicKey,
        corrupt_nonce: bool,
    ) {
        let mut nonce = [0u8; NONCE_LEN];
        client.read_exact(&mut nonce).await.unwrap();

        let mut payload = nonce.to_vec();
        if corrupt_nonce {
            payload[0] ^= 0xFF;
        }
        payload.extend_from_slice(&device_id);

        let ciphertext = rops::encrypt(server_public, &payload).unwrap();
        client.write_all(&ciphertext).await.unwrap();

        if corrupt_nonce {
            return;
        }

        let mut response = vec![0u8; 128 + 256];
        client.read_exact(&mut response).await.unwrap();
        let ciphertext = &response[0..128];
        let signature = &response[128..];

        let mac = hmac_sha1(
            &rops::decrypt(device_private, ciphertext).unwrap(),
            ciphertext,
        );
        rops::verify_sha1(server_public, &mac, signature).unwrap();

        let session_key_bytes = rops::decrypt(device_private, ciphertext).unwrap();
        let session_key = SessionKey::try_from(session_key_bytes.as_slice()).unwrap();
        let mut cipher = CipherStream::new(session_key.key(), session_key.iv());

        let hello = cipher.encrypt(b"hello-payload");
        let mut framed = device_wire::ChunkCodec::new();
        let mut buf = bytes::BytesMut::new();
        use tokio_util::codec::Encoder;
        Encoder::<Vec<u8>>::encode(&mut framed, hello, &mut buf).unwrap();
        client.write_all(&buf).await.unwrap();
    }

    #[tokio::test]
    async fn completes_happy_path_and_recovers_hello() {
        let (keystore, _dir) = test_keystore();
        let server_priv = rops::generate_keypair(2048).unwrap();
        let server_pub = RsaPublicKey::from(&server_priv);

        let device_priv = rops::generate_keypair(1024).unwrap();
        let device_pub = RsaPublicKey::from(&device_priv);
        let device_id = [7u8; 12];

        let id = DeviceId::from_bytes(&device_id).unwrap();
        keystore.save_handshake_key(&id, &device_pub).await.unwrap();

        let (server_io, client_io) = duplex(4096);

        let device_task = tokio::spawn(async move {
            run_device_side(client_io, device_id, &device_priv, &server_pub, false).await;
        });

        let handshake = Handshake::new(
            keystore,
            Arc::new(server_priv),
            Duration::from_secs(10),
            Duration::from_secs(5),
            true,
        );

        let output = handshake.run(server_io).await.unwrap();
        assert_eq!(output.device_id, id);
        assert_eq!(output.handshake_buffer, b"hello-payload");
        assert!(output.pending_buffers.is_empty());

        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_mismatched_nonce() {
        let (keystore, _dir) = test_keystore();
        let server_priv = rops::generate_keypair(2048).unwrap();
        let server_pub = RsaPublicKey::from(&server_priv);

        let device_priv = rops::generate_keypair(1024).unwrap();
        let device_pub = RsaPublicKey::from(&device_priv);
        let device_id = [3u8; 12];
        let id = DeviceId::from_bytes(&device_id).unwrap();
        keystore.save_handshake_key(&id, &device_pub).await.unwrap();

        let (server_io, client_io) = duplex(4096);

        tokio::spawn(async move {
            run_device_side(client_io, device_id, &device_priv, &server_pub, true).await;
        });

        let handshake = Handshake::new(
            keystore,
            Arc::new(server_priv),
            Duration::from_secs(10),
            Duration::from_secs(5),
            true,
        );

        let result = handshake.run(server_io).await;
        assert!(matches!(result, Err(HandshakeError::HandshakeNonceMismatch)));
    }

    #[tokio::test]
    async fn rejects_unknown_device_with_no_offered_key() {
        let (keystore, _dir) = test_keystore();
        let server_priv = rops::generate_keypair(2048).unwrap();
        let server_pub = RsaPublicKey::from(&server_priv);

        let device_priv = rops::generate_keypair(1024).unwrap();
        let device_id = [9u8; 12];

        let (server_io, client_io) = duplex(4096);

        tokio::spawn(async move {
            run_device_side(client_io, device_id, &device_priv, &server_pub, false).await;
        });

        let handshake = Handshake::new(
            keystore,
            Arc::new(server_priv),
            Duration::from_secs(10),
            Duration::from_secs(5),
            true,
        );

        let result = handshake.run(server_io).await;
        assert!(matches!(result, Err(HandshakeError::HandshakeUnknownDevice)));
    }
}
