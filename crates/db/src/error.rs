//! Typed error type for the db crate.

use thiserror::Error;

use engine::EngineError;
use queue::QueueError;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored column could not be mapped back onto a domain type.
    #[error("cannot decode column '{column}': {message}")]
    Decode { column: &'static str, message: String },
}

impl DbError {
    pub(crate) fn decode(column: &'static str, err: impl ToString) -> Self {
        Self::Decode {
            column,
            message: err.to_string(),
        }
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<DbError> for QueueError {
    fn from(err: DbError) -> Self {
        QueueError::Backend(err.to_string())
    }
}
