//! Node-level error type.

use thiserror::Error;

/// Errors returned by executor lookup and by a node's `execute` method.
///
/// The engine uses the variant to decide what happens next:
/// - `NotFound`  — no executor registered; `action` nodes fall back to a no-op.
/// - `Retryable` — the node is re-run with exponential back-off.
/// - `Fatal`     — the node is recorded as failed straight away.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The factory has nothing registered under this action key.
    #[error("no executor registered for action type '{0}'")]
    NotFound(String),

    /// Transient failure; the engine may retry the node.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("{0}")]
    Fatal(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
