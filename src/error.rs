/// Low-level atomic-store errors. This is the error type for the
/// `AtomicStore` trait — store operations can only fail with infrastructure
/// errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Application-level errors for admission and limiter logic.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("unknown payment provider: {0}")]
    UnknownProvider(String),

    #[error("queue item serialization failed: {0}")]
    ItemSerialization(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type Result<T> = std::result::Result<T, GateError>;
