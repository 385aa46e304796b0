//! Downstream dispatch seam.
//!
//! The processor replays a queued request against the protected service
//! through this trait. Implementations decide transport; classification
//! of failures into retryable and terminal lives here so the processor
//! stays transport-agnostic.

use thiserror::Error;

use crate::item::QueueItem;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("status {status}: {message}")]
    Status { status: u16, message: String },

    /// Connection-level failure before a response was produced.
    #[error("transport error: {0}")]
    Transport(String),

    /// The captured request cannot be replayed at all.
    #[error("unreplayable request: {0}")]
    Invalid(String),
}

impl BackendError {
    /// Timeouts and server-side errors are worth one more attempt;
    /// client errors and malformed requests are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Timeout(_) => true,
            BackendError::Status { status, .. } => *status >= 500,
            BackendError::Transport(_) | BackendError::Invalid(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: Option<String>,
}

pub trait Backend: Send + Sync {
    /// Replay the item's captured request. Blocking is acceptable; the
    /// caller budgets one dispatch at a time per lane.
    fn execute(&self, item: &QueueItem) -> Result<BackendResponse, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BackendError::Timeout("read".into()).is_retryable());
        assert!(BackendError::Status {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!BackendError::Status {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!BackendError::Transport("refused".into()).is_retryable());
        assert!(!BackendError::Invalid("no request data".into()).is_retryable());
    }
}
