//! `engine` crate — workflow models, validation, admission control, circuit
//! breaking, traversal and execution analytics.
//!
//! Callers go through [`Governor`]; it validates and admits a run, then hands
//! the resulting [`RunTicket`] to the [`Orchestrator`].

pub mod models;
pub mod error;
pub mod config;
pub mod clock;
pub mod store;
pub mod memory;
pub mod probe;
pub mod validator;
pub mod condition;
pub mod circuit;
pub mod quota;
pub mod orchestrator;
pub mod governance;
pub mod analyzer;

pub use models::{
    Context, Edge, Execution, ExecutionResult, ExecutionStatus, NodeDefinition, NodeKind,
    RunOptions, WorkflowDefinition, WorkflowRecord,
};
pub use error::EngineError;
pub use config::EngineConfig;
pub use circuit::{CircuitBreaker, CircuitThresholds};
pub use quota::{AdmissionDecision, QuotaGovernor};
pub use orchestrator::Orchestrator;
pub use governance::{CancelOutcome, Governor, RunTicket};
pub use analyzer::MetricsAnalyzer;
pub use validator::{validate, ValidationReport};

#[cfg(test)]
mod orchestrator_tests;
