//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the workflow engine.
///
/// Node failures are *not* represented here: they are contained inside a run
/// and reported through `ExecutionResult::errors`.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Rejected before a run starts ------

    /// Bad graph, payload or options. No execution row is created.
    #[error("workflow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// One or more quota checks refused the run.
    #[error("resource limits exceeded: {}", .0.join("; "))]
    Admission(Vec<String>),

    /// The circuit guarding this service is open.
    #[error("circuit breaker is open for '{service}'")]
    CircuitOpen { service: String },

    #[error("workflow {0} is not active")]
    WorkflowInactive(Uuid),

    #[error("workflow {0} definition is empty")]
    EmptyDefinition(Uuid),

    // ------ Collaborator failures ------

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// Completed / Failed / Cancelled executions are immutable.
    #[error("execution {0} is already in a terminal state")]
    ExecutionFinalized(Uuid),

    #[error("store error: {0}")]
    Store(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unexpected failure after a run was admitted.
    #[error("system error: {0}")]
    System(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for refusals that happen before any execution row exists.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Admission(_)
                | Self::CircuitOpen { .. }
                | Self::WorkflowInactive(_)
                | Self::EmptyDefinition(_)
        )
    }
}
