use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("no response to publishAndListenForResponse within the configured timeout")]
    ResponseTimeout,
}
