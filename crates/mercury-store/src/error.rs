use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store key must not be empty")]
    EmptyKey,

    #[error("store used after close")]
    Disposed,
}

impl From<StoreError> for mercury_core::MercuryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::EmptyKey => mercury_core::MercuryError::InvalidArg("empty store key".into()),
            StoreError::Disposed => mercury_core::MercuryError::Disposed("expiring store"),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
