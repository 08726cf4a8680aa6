//! The OTA flasher: claims write ownership of a [`DeviceSession`], pushes a
//! firmware buffer across it in fixed-size chunks, and tears the claim back
//! down whatever happens — success, abort, timeout, or missed-chunk flood.
//!
//! Two modes, negotiated from the device's `UpdateReady` payload: slow OTA
//! (request/ack per chunk) and fast OTA (pipelined, missed chunks reported
//! asynchronously and retransmitted in a drain phase at the end).

mod error;
mod retry;

pub use error::OtaError;
pub use retry::RetrySchedule;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use device_common::config::OtaConfig;
use device_session::{event_key, DeviceSession};
use device_wire::{CoapOption, MessageName};
use tracing::{info, warn};

/// Default/maximum chunk sizes and retry/timeout constants, from spec.md §4.3.
pub const DEFAULT_CHUNK_SIZE: u16 = 256;
pub const MAX_CHUNK_SIZE: u16 = 594;
pub const MAX_MISSED_CHUNKS: usize = 10;

/// Bit 0 of `UpdateBegin`'s flags byte: "this server supports fast OTA".
const FLAG_FAST_OTA_SUPPORTED: u8 = 0x01;

/// State describing one in-flight OTA transfer, owned by exactly one
/// [`Flasher::run`] call for the lifetime of that call. `missed_chunks`,
/// `chunk_index`, `last_crc`, and `protocol_version` are mutated both by the
/// send loop and by the `on(msg_chunkmissed, ...)` handler installed in
/// [`Flasher::subscribe_chunk_missed`], which runs concurrently on the
/// session's dispatch task — hence callers share this behind an
/// `Arc<Mutex<_>>` rather than threading it through as a plain `&mut`.
pub struct OtaJob {
    pub buffer: Vec<u8>,
    pub chunk_size: u16,
    pub flags: u8,
    pub protocol_version: u8,
    pub missed_chunks: BTreeSet<u16>,
    pub chunk_index: i64,
    pub last_crc: u32,
}

/// Orchestrates one OTA update across a [`DeviceSession`] the flasher has
/// claimed ownership of.
pub struct Flasher {
    chunk_size: u16,
    max_missed_chunks: usize,
    overall_timeout: Duration,
    update_ready_schedule: RetrySchedule,
    ignore_missed_chunks: bool,
    drain_wait: Duration,
    drain_rounds: u32,
}

impl Flasher {
    pub fn new(config: &OtaConfig) -> Self {
        Self {
            chunk_size: config.chunk_size.min(config.max_chunk_size).max(1),
            max_missed_chunks: config.max_missed_chunks,
            overall_timeout: Duration::from_secs(config.overall_timeout_secs),
            update_ready_schedule: RetrySchedule::particle_default(
                Duration::from_secs(config.update_ready_retry_secs),
                config.update_ready_retries,
                Duration::from_secs(config.update_ready_final_timeout_secs),
            ),
            ignore_missed_chunks: config.ignore_missed_chunks,
            drain_wait: Duration::from_secs(3),
            drain_rounds: 3,
        }
    }

    /// Override the chunk size (tests want something smaller than 256 to
    /// keep fixtures readable) and retry/drain waits (tests want these at
    /// zero so the suite doesn't actually sleep).
    #[cfg(test)]
    pub fn with_overrides(
        mut self,
        chunk_size: u16,
        update_ready_schedule: RetrySchedule,
        drain_wait: Duration,
        drain_rounds: u32,
    ) -> Self {
        self.chunk_size = chunk_size;
        self.update_ready_schedule = update_ready_schedule;
        self.drain_wait = drain_wait;
        self.drain_rounds = drain_rounds;
        self
    }

    /// Run the full OTA protocol: claim, prepare, begin, send loop, drain,
    /// finish. Ownership is released and the buffer dropped on every exit
    /// path, exactly once.
    pub async fn run(
        &self,
        session: &DeviceSession,
        buffer: Vec<u8>,
        dest_flag: u8,
        dest_addr: u32,
    ) -> Result<(), OtaError> {
        if buffer.is_empty() {
            return Err(OtaError::EmptyBuffer);
        }

        let owner = format!("ota-{}", uuid::Uuid::new_v4());
        session.take_ownership(owner.clone()).await.map_err(|_| OtaError::ClaimDenied)?;

        let outcome = tokio::time::timeout(
            self.overall_timeout,
            self.run_protocol(session, &owner, buffer, dest_flag, dest_addr),
        )
        .await;

        let _ = session.release_ownership(owner).await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(OtaError::Timeout),
        }
    }

    async fn run_protocol(
        &self,
        session: &DeviceSession,
        owner: &str,
        buffer: Vec<u8>,
        dest_flag: u8,
        dest_addr: u32,
    ) -> Result<(), OtaError> {
        let flood = Arc::new(AtomicBool::new(false));
        let job = Arc::new(Mutex::new(OtaJob {
            buffer,
            chunk_size: self.chunk_size,
            flags: FLAG_FAST_OTA_SUPPORTED,
            protocol_version: 0,
            missed_chunks: BTreeSet::new(),
            chunk_index: -1,
            last_crc: 0,
        }));

        self.subscribe_chunk_missed(session, job.clone(), flood.clone()).await?;

        let (flags, chunk_size, file_size) = {
            let g = job.lock().expect("ota job mutex poisoned");
            (g.flags, g.chunk_size, g.buffer.len() as u32)
        };
        let protocol_version = self.begin(session, owner, flags, chunk_size, file_size, dest_flag, dest_addr).await?;
        job.lock().expect("ota job mutex poisoned").protocol_version = protocol_version;
        let fast_ota = protocol_version > 0;

        self.send_loop(session, owner, &job, fast_ota, &flood).await?;

        if fast_ota {
            self.drain(session, owner, &job, &flood).await?;
        }

        session
            .send_message(MessageName::UpdateDone, Vec::new(), Vec::new(), Some(owner.to_string()))
            .await?;
        info!(device = %session.id(), "OTA update done");

        Ok(())
    }

    /// Register the session-internal handler for inbound `ChunkMissed`:
    /// immediately ack it, then record the missed indexes (unless this is
    /// slow OTA and `ignore_missed_chunks` is set).
    async fn subscribe_chunk_missed(
        &self,
        session: &DeviceSession,
        job: Arc<Mutex<OtaJob>>,
        flood: Arc<AtomicBool>,
    ) -> Result<(), OtaError> {
        let ack_session = session.clone();
        let max_missed = self.max_missed_chunks;
        let ignore_missed_chunks = self.ignore_missed_chunks;

        session
            .on(
                event_key(MessageName::ChunkMissed),
                Arc::new(move |msg| {
                    let ack_session = ack_session.clone();
                    let token = msg.token.clone();
                    tokio::spawn(async move {
                        let _ = ack_session.send_reply(MessageName::ChunkMissedAck, token, Vec::new()).await;
                    });

                    let indexes = msg.payload.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));

                    let mut guard = job.lock().expect("ota job mutex poisoned");
                    let fast_ota = guard.protocol_version > 0;
                    if !fast_ota && ignore_missed_chunks {
                        return;
                    }
                    guard.missed_chunks.extend(indexes);
                    if guard.missed_chunks.len() > max_missed {
                        warn!(count = guard.missed_chunks.len(), max = max_missed, "missed-chunk flood, failing OTA");
                        flood.store(true, Ordering::SeqCst);
                    }
                }),
            )
            .await?;
        Ok(())
    }

    /// Send `UpdateBegin` and wait for `UpdateReady` (returning its
    /// protocol-version byte) or `UpdateAbort`, resending per the retry
    /// schedule on timeout.
    #[allow(clippy::too_many_arguments)]
    async fn begin(
        &self,
        session: &DeviceSession,
        owner: &str,
        flags: u8,
        chunk_size: u16,
        file_size: u32,
        dest_flag: u8,
        dest_addr: u32,
    ) -> Result<u8, OtaError> {
        let payload = encode_update_begin(flags, chunk_size, file_size, dest_flag, dest_addr);

        for wait in self.update_ready_schedule.waits() {
            session
                .send_message(MessageName::UpdateBegin, Vec::new(), payload.clone(), Some(owner.to_string()))
                .await?;

            let raced = tokio::time::timeout(*wait, race_ready_or_abort(session)).await;
            match raced {
                Ok(Ok(ReadyOrAbort::Ready(version))) => return Ok(version),
                Ok(Ok(ReadyOrAbort::Abort(reason))) => return Err(OtaError::Aborted(reason)),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue, // timed out this attempt, resend
            }
        }

        Err(OtaError::BeginTimeout)
    }

    async fn send_loop(
        &self,
        session: &DeviceSession,
        owner: &str,
        job: &Arc<Mutex<OtaJob>>,
        fast_ota: bool,
        flood: &Arc<AtomicBool>,
    ) -> Result<(), OtaError> {
        let (total_chunks, chunk_size) = {
            let g = job.lock().expect("ota job mutex poisoned");
            (g.buffer.len().div_ceil(g.chunk_size as usize), g.chunk_size as usize)
        };

        for index in 0..total_chunks {
            if flood.load(Ordering::SeqCst) {
                let got = job.lock().expect("ota job mutex poisoned").missed_chunks.len();
                return Err(OtaError::MissedChunkFlood { max: self.max_missed_chunks, got });
            }

            let chunk = {
                let g = job.lock().expect("ota job mutex poisoned");
                padded_chunk(&g.buffer, index, chunk_size)
            };
            let crc = self.send_chunk(session, owner, &chunk, index as u16, fast_ota).await?;

            let mut g = job.lock().expect("ota job mutex poisoned");
            g.chunk_index = index as i64;
            g.last_crc = crc;
        }

        Ok(())
    }

    /// Send one `Chunk` (CRC, plus an index query when pipelining) and, in
    /// slow OTA, await its `ChunkReceived`. Returns the chunk's CRC32 on
    /// success.
    async fn send_chunk(
        &self,
        session: &DeviceSession,
        owner: &str,
        chunk: &[u8],
        index: u16,
        fast_ota: bool,
    ) -> Result<u32, OtaError> {
        let crc = crc32fast::hash(chunk);
        let mut options = vec![CoapOption::uri_query(crc.to_be_bytes().to_vec())];
        if fast_ota {
            options.push(CoapOption::uri_query(index.to_be_bytes().to_vec()));
        }

        let (sent, token) = session
            .send_message(MessageName::Chunk, options, chunk.to_vec(), Some(owner.to_string()))
            .await?;
        if !sent {
            return Err(OtaError::ClaimDenied);
        }

        if !fast_ota {
            let ack = session.listen_for(MessageName::ChunkReceived, None, Some(token)).await?;
            match ack.payload.first() {
                Some(0) => {}
                other => return Err(OtaError::ChunkReceivedFail(other.copied().unwrap_or(0xFF))),
            }
        }

        Ok(crc)
    }

    async fn drain(
        &self,
        session: &DeviceSession,
        owner: &str,
        job: &Arc<Mutex<OtaJob>>,
        flood: &Arc<AtomicBool>,
    ) -> Result<(), OtaError> {
        tokio::time::sleep(self.drain_wait).await;

        for _ in 0..self.drain_rounds {
            if flood.load(Ordering::SeqCst) {
                let got = job.lock().expect("ota job mutex poisoned").missed_chunks.len();
                return Err(OtaError::MissedChunkFlood { max: self.max_missed_chunks, got });
            }

            let (pending, chunk_size): (Vec<u16>, usize) = {
                let mut g = job.lock().expect("ota job mutex poisoned");
                (std::mem::take(&mut g.missed_chunks).into_iter().collect(), g.chunk_size as usize)
            };

            if !pending.is_empty() {
                info!(count = pending.len(), "retransmitting missed chunks");
                for index in pending {
                    let chunk = {
                        let g = job.lock().expect("ota job mutex poisoned");
                        padded_chunk(&g.buffer, index as usize, chunk_size)
                    };
                    let crc = self.send_chunk(session, owner, &chunk, index, true).await?;
                    job.lock().expect("ota job mutex poisoned").last_crc = crc;
                }
            }

            tokio::time::sleep(self.drain_wait).await;
        }

        Ok(())
    }
}

enum ReadyOrAbort {
    Ready(u8),
    Abort(u8),
}

async fn race_ready_or_abort(session: &DeviceSession) -> Result<ReadyOrAbort, device_session::SessionError> {
    tokio::select! {
        ready = session.listen_for(MessageName::UpdateReady, None, None) => {
            let msg = ready?;
            Ok(ReadyOrAbort::Ready(msg.payload.first().copied().unwrap_or(0)))
        }
        abort = session.listen_for(MessageName::UpdateAbort, None, None) => {
            let msg = abort?;
            Ok(ReadyOrAbort::Abort(msg.payload.first().copied().unwrap_or(0)))
        }
    }
}

fn encode_update_begin(flags: u8, chunk_size: u16, file_size: u32, dest_flag: u8, dest_addr: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.push(flags);
    out.extend_from_slice(&chunk_size.to_be_bytes());
    out.extend_from_slice(&file_size.to_be_bytes());
    out.push(dest_flag);
    out.extend_from_slice(&dest_addr.to_be_bytes());
    out
}

/// `buffer[index*chunk_size .. ]`, truncated to `chunk_size` bytes and, for
/// the final short chunk, zero-padded out to `chunk_size` — device firmware
/// requires fixed-size chunks, so this padding is load-bearing, not cosmetic.
fn padded_chunk(buffer: &[u8], index: usize, chunk_size: usize) -> Vec<u8> {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(buffer.len());
    let mut chunk = if start < buffer.len() { buffer[start..end].to_vec() } else { Vec::new() };
    chunk.resize(chunk_size, 0);
    chunk
}
