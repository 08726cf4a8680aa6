//! The chunking frame transform: on the encrypted wire, every message is a
//! 2-byte big-endian length prefix followed by exactly that many bytes of
//! (already AES-enciphered) payload. Zero-length frames are never emitted
//! and are rejected on read.
//!
//! Devices that connect with chunking disabled speak raw CoAP directly over
//! the socket with no length prefix at all; see [`Transport`].

use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::WireError;

/// Maximum frame payload length this server will emit or accept. Comfortably
/// above the largest OTA chunk frame plus CoAP + AES-CBC padding overhead.
pub const MAX_FRAME_LEN: usize = 8192;

/// `tokio_util::codec::{Encoder, Decoder}` pair implementing the 2-byte
/// length-prefixed chunking scheme.
#[derive(Debug, Default)]
pub struct ChunkCodec {
    max_frame_len: usize,
}

impl ChunkCodec {
    pub fn new() -> Self {
        Self { max_frame_len: MAX_FRAME_LEN }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Decoder for ChunkCodec {
    type Item = Vec<u8>;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 2 {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;

        if len == 0 {
            return Err(WireError::ZeroLengthFrame);
        }
        if len > self.max_frame_len {
            return Err(WireError::FrameTooLarge { max: self.max_frame_len, actual: len });
        }

        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }

        src.advance(2);
        let frame = src.split_to(len);
        Ok(Some(frame.to_vec()))
    }
}

impl Encoder<Vec<u8>> for ChunkCodec {
    type Error = WireError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.is_empty() {
            return Err(WireError::ZeroLengthFrame);
        }
        if item.len() > self.max_frame_len {
            return Err(WireError::FrameTooLarge { max: self.max_frame_len, actual: item.len() });
        }

        dst.reserve(2 + item.len());
        dst.put_u16(item.len() as u16);
        dst.put_slice(&item);
        Ok(())
    }
}

impl Encoder<&[u8]> for ChunkCodec {
    type Error = WireError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<Vec<u8>>::encode(self, item.to_vec(), dst)
    }
}

/// Whether a connection's frames are wrapped by [`ChunkCodec`] or sent
/// as bare CoAP datagrams back-to-back on the stream.
///
/// Most deployed firmware always chunks; `handshake.chunking_enabled = false`
/// exists for bench/simulator devices that talk raw CoAP over a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Chunked,
    Raw,
}

/// A socket wrapped in whichever transform matches its negotiated
/// [`Transport`]. Handed from the handshake to the session layer so both
/// sides agree on how to read/write frames without re-deriving the mode.
pub enum Conn<T> {
    Chunked(Framed<T, ChunkCodec>),
    Raw(T),
}

impl<T> Conn<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn chunked(io: T) -> Self {
        Conn::Chunked(Framed::new(io, ChunkCodec::new()))
    }

    pub fn raw(io: T) -> Self {
        Conn::Raw(io)
    }

    pub fn transport(&self) -> Transport {
        match self {
            Conn::Chunked(_) => Transport::Chunked,
            Conn::Raw(_) => Transport::Raw,
        }
    }

    /// Read the next frame payload. In [`Transport::Raw`] mode a "frame" is
    /// whatever bytes a single `read` syscall returns (no length prefix to
    /// delimit it), matching the bare bench/simulator pipe this mode exists
    /// for.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        match self {
            Conn::Chunked(framed) => match framed.next().await {
                Some(result) => Ok(Some(result?)),
                None => Ok(None),
            },
            Conn::Raw(io) => {
                let mut buf = vec![0u8; MAX_FRAME_LEN];
                let n = io.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf))
            }
        }
    }

    pub async fn write_frame(&mut self, frame: Vec<u8>) -> Result<(), WireError> {
        match self {
            Conn::Chunked(framed) => {
                framed.send(frame).await?;
                Ok(())
            }
            Conn::Raw(io) => {
                io.write_all(&frame).await?;
                Ok(())
            }
        }
    }

    /// Read exactly `len` bytes off the raw socket, bypassing any framing.
    /// Used only during the handshake, before a [`Transport`] has been
    /// negotiated (the RSA exchange is fixed-length and unframed on the
    /// wire regardless of `chunking_enabled`).
    pub async fn read_exact_raw(&mut self, len: usize) -> Result<Vec<u8>, WireError>
    where
        T: Unpin,
    {
        let mut buf = vec![0u8; len];
        match self {
            Conn::Chunked(framed) => {
                framed.get_mut().read_exact(&mut buf).await?;
            }
            Conn::Raw(io) => {
                io.read_exact(&mut buf).await?;
            }
        }
        Ok(buf)
    }

    pub async fn write_all_raw(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        match self {
            Conn::Chunked(framed) => framed.get_mut().write_all(bytes).await?,
            Conn::Raw(io) => io.write_all(bytes).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frames: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        for f in frames {
            Encoder::<&[u8]>::encode(&mut codec, *f, &mut buf).unwrap();
        }

        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn round_trips_single_frame() {
        let out = roundtrip(&[b"hello"]);
        assert_eq!(out, vec![b"hello".to_vec()]);
    }

    #[test]
    fn round_trips_multiple_frames_back_to_back() {
        let out = roundtrip(&[b"abc", b"de", b"fghij"]);
        assert_eq!(out, vec![b"abc".to_vec(), b"de".to_vec(), b"fghij".to_vec()]);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(5);
        buf.put_slice(b"ab");

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(b"cde");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b"abcde".to_vec()));
    }

    #[test]
    fn rejects_zero_length_frame_on_encode() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        assert!(Encoder::<&[u8]>::encode(&mut codec, b"".as_slice(), &mut buf).is_err());
    }

    #[test]
    fn rejects_zero_length_frame_on_decode() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u16(0);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_frame_over_max_len() {
        let mut codec = ChunkCodec::with_max_frame_len(4);
        let mut buf = BytesMut::new();
        assert!(Encoder::<&[u8]>::encode(&mut codec, b"abcde".as_slice(), &mut buf).is_err());
    }
}
