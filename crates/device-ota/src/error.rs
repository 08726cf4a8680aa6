use thiserror::Error;

#[derive(Debug, Error)]
pub enum OtaError {
    #[error("firmware buffer is empty")]
    EmptyBuffer,

    #[error("device declined to hand over write ownership")]
    ClaimDenied,

    #[error("no UpdateReady/UpdateAbort within the retry schedule")]
    BeginTimeout,

    #[error("device aborted the update, reason code {0}")]
    Aborted(u8),

    #[error("device reported a failed ChunkReceived status {0}")]
    ChunkReceivedFail(u8),

    #[error("more than {max} chunks outstanding as missed at once (got {got})")]
    MissedChunkFlood { max: usize, got: usize },

    #[error("OTA exceeded its overall deadline")]
    Timeout,

    #[error(transparent)]
    Session(#[from] device_session::SessionError),

    #[error(transparent)]
    Wire(#[from] device_wire::WireError),
}
