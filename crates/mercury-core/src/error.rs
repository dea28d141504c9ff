use thiserror::Error;

#[derive(Debug, Error)]
pub enum MercuryError {
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Used after dispose: {0}")]
    Disposed(&'static str),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("AI stream produced no content")]
    EmptyResponse,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MercuryError {
    /// True for cooperative cancellation; never treated as a failure by
    /// the batch executor or the state machine.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MercuryError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, MercuryError>;
