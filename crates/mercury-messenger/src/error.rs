use thiserror::Error;

/// Errors surfaced by a messenger adapter. Retryable conditions are the
/// adapter's own business; the core sees only terminal failures.
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("messenger transport error: {0}")]
    Transport(String),

    #[error("messenger rejected the request: {0}")]
    Rejected(String),
}

impl From<MessengerError> for mercury_core::MercuryError {
    fn from(e: MessengerError) -> Self {
        mercury_core::MercuryError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MessengerError>;
