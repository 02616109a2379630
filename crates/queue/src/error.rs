//! Typed error type for the queue crate.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("job {id} is {status}, expected processing")]
    NotProcessing { id: Uuid, status: String },

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("malformed job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<QueueError> for engine::EngineError {
    fn from(err: QueueError) -> Self {
        engine::EngineError::Dispatch(err.to_string())
    }
}
