use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("frame exceeds maximum length {max} (got {actual})")]
    FrameTooLarge { max: usize, actual: usize },

    #[error("zero-length frame")]
    ZeroLengthFrame,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
