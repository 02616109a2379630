//! The governed entry point for running workflows.
//!
//! Every run goes through [`Governor::admit`]: workflow lookup, graph and
//! input validation, quota admission, and the workflow-level circuit. The
//! resulting [`RunTicket`] is the only way to reach
//! [`Orchestrator::run`](crate::orchestrator::Orchestrator::run).

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use nodes::NodeExecutorFactory;

use crate::circuit::{CircuitBreaker, CircuitError, CircuitStats, CircuitThresholds};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::models::{
    Context, Execution, ExecutionResult, ExecutionStatus, ExecutionUpdate, RunOptions,
    WorkflowDefinition, WorkflowRecord,
};
use crate::orchestrator::Orchestrator;
use crate::probe::ResourceProbe;
use crate::quota::{AdmissionDecision, QuotaGovernor};
use crate::store::{
    AsyncDispatcher, ExecutionStore, HistoryWindow, JobDescriptor, JobId, KeyedCache,
    WorkflowStore,
};
use crate::validator;
use crate::EngineError;

/// Proof that a run passed validation and admission.
///
/// Constructed only by [`Governor::admit`]; consumed by the orchestrator.
#[derive(Debug)]
pub struct RunTicket {
    pub(crate) workflow: WorkflowRecord,
    pub(crate) definition: WorkflowDefinition,
    pub(crate) payload: Context,
    pub(crate) options: RunOptions,
}

impl RunTicket {
    pub fn workflow(&self) -> &WorkflowRecord {
        &self.workflow
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }
}

/// What [`Governor::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The row was flipped to `Cancelled` and the run, executing in this
    /// process, was told to stop before its next node.
    Signalled,
    /// The row was flipped to `Cancelled`; no local run was found to signal.
    Recorded,
}

/// A run that completed with node errors, routed through the circuit as a
/// failure.
#[derive(Debug)]
enum Unsuccessful {
    Failed(ExecutionResult),
    Error(EngineError),
}

impl std::fmt::Display for Unsuccessful {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(result) => write!(f, "{} node(s) failed", result.errors.len()),
            Self::Error(e) => write!(f, "{e}"),
        }
    }
}

pub struct Governor {
    workflows: Arc<dyn WorkflowStore>,
    executions: Arc<dyn ExecutionStore>,
    breaker: Arc<CircuitBreaker>,
    thresholds: CircuitThresholds,
    quota: QuotaGovernor,
    orchestrator: Orchestrator,
    dispatcher: Option<Arc<dyn AsyncDispatcher>>,
    clock: Arc<dyn Clock>,
}

impl Governor {
    pub fn new(
        config: EngineConfig,
        workflows: Arc<dyn WorkflowStore>,
        executions: Arc<dyn ExecutionStore>,
        cache: Arc<dyn KeyedCache>,
        factory: Arc<dyn NodeExecutorFactory>,
        probe: Arc<dyn ResourceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let thresholds = CircuitThresholds::from(&config.circuit);
        let breaker = Arc::new(CircuitBreaker::new(
            cache.clone(),
            clock.clone(),
            config.circuit.state_ttl(),
        ));
        let quota = QuotaGovernor::new(
            config.quota.clone(),
            config.execution.clone(),
            executions.clone(),
            cache,
            probe,
            clock.clone(),
        );
        let orchestrator = Orchestrator::new(
            executions.clone(),
            factory,
            breaker.clone(),
            thresholds,
            config.execution,
            clock.clone(),
        );

        Self {
            workflows,
            executions,
            breaker,
            thresholds,
            quota,
            orchestrator,
            dispatcher: None,
            clock,
        }
    }

    /// Enable [`Governor::submit`].
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn AsyncDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Circuit key guarding whole runs of one workflow.
    pub fn workflow_service(workflow_id: Uuid) -> String {
        format!("workflow_{workflow_id}")
    }

    // -----------------------------------------------------------------------
    // Admission.
    // -----------------------------------------------------------------------

    /// Run every pre-execution check and issue a ticket.
    ///
    /// # Errors
    /// `NotFound`, `WorkflowInactive`, `EmptyDefinition`, `Validation`,
    /// `Admission` or `CircuitOpen`. None of them creates an execution row.
    #[instrument(skip(self, payload, options), fields(user_id = ?options.user_id))]
    pub async fn admit(
        &self,
        workflow_id: Uuid,
        payload: Context,
        options: RunOptions,
    ) -> Result<RunTicket, EngineError> {
        let workflow = self.workflows.find_or_fail(workflow_id).await?;

        if !workflow.is_active {
            warn!(%workflow_id, "refusing to run inactive workflow");
            return Err(EngineError::WorkflowInactive(workflow_id));
        }
        if is_empty_definition(&workflow.definition) {
            warn!(%workflow_id, "refusing to run workflow with empty definition");
            return Err(EngineError::EmptyDefinition(workflow_id));
        }

        let report = validator::validate(&workflow.definition, &payload, &options);
        if !report.valid {
            warn!(%workflow_id, errors = ?report.errors, "workflow validation failed");
            return Err(EngineError::Validation(report.errors));
        }

        let decision = self.check_admission(&workflow, &options).await;
        if !decision.allowed {
            return Err(EngineError::Admission(decision.reasons));
        }

        let service = Self::workflow_service(workflow_id);
        if !self.breaker.is_available(&service, self.thresholds).await? {
            warn!(%workflow_id, %service, "workflow circuit open, refusing run");
            return Err(EngineError::CircuitOpen { service });
        }

        let definition =
            WorkflowDefinition::from_value(&workflow.definition).map_err(EngineError::Validation)?;

        info!(%workflow_id, name = %workflow.name, "run admitted");
        Ok(RunTicket {
            workflow,
            definition,
            payload,
            options,
        })
    }

    pub async fn check_admission(
        &self,
        workflow: &WorkflowRecord,
        options: &RunOptions,
    ) -> AdmissionDecision {
        self.quota.check_admission(workflow, options).await
    }

    // -----------------------------------------------------------------------
    // Running.
    // -----------------------------------------------------------------------

    /// Admit and run synchronously.
    pub async fn execute(
        &self,
        workflow_id: Uuid,
        payload: Context,
        options: RunOptions,
    ) -> Result<ExecutionResult, EngineError> {
        let ticket = self.admit(workflow_id, payload, options).await?;
        self.run(ticket).await
    }

    /// Run an admitted ticket under the workflow's circuit.
    ///
    /// A run that finishes `Failed` counts as a circuit failure but is still
    /// returned as `Ok`.
    pub async fn run(&self, ticket: RunTicket) -> Result<ExecutionResult, EngineError> {
        let workflow_id = ticket.workflow.id;
        let service = Self::workflow_service(workflow_id);

        let outcome = self
            .breaker
            .execute(&service, self.thresholds, move || async move {
                match self.orchestrator.run(ticket).await {
                    Ok(result) if result.status == ExecutionStatus::Failed => {
                        Err(Unsuccessful::Failed(result))
                    }
                    Ok(result) => Ok(result),
                    Err(e) => Err(Unsuccessful::Error(e)),
                }
            })
            .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(CircuitError::Inner(Unsuccessful::Failed(result))) => Ok(result),
            Err(CircuitError::Inner(Unsuccessful::Error(e))) => Err(e),
            Err(CircuitError::Open { service }) => {
                warn!(%workflow_id, %service, "workflow circuit opened before run started");
                Err(EngineError::CircuitOpen { service })
            }
            Err(CircuitError::State(e)) => Err(e),
        }
    }

    /// Admit, then hand the run to the async dispatcher.
    ///
    /// The worker that picks the job up admits it again before running.
    #[instrument(skip(self, payload, options))]
    pub async fn submit(
        &self,
        workflow_id: Uuid,
        payload: Context,
        options: RunOptions,
    ) -> Result<JobId, EngineError> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| EngineError::Dispatch("no async dispatcher configured".into()))?;

        let ticket = self.admit(workflow_id, payload, options).await?;
        let job_id = dispatcher
            .enqueue(JobDescriptor {
                workflow_id,
                payload: ticket.payload,
                options: ticket.options,
            })
            .await?;

        info!(%workflow_id, %job_id, "run queued");
        Ok(job_id)
    }

    /// Entry point for queue workers.
    pub async fn run_job(&self, job: JobDescriptor) -> Result<ExecutionResult, EngineError> {
        self.execute(job.workflow_id, job.payload, job.options).await
    }

    // -----------------------------------------------------------------------
    // Queries and control.
    // -----------------------------------------------------------------------

    pub async fn status(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.executions
            .find(execution_id)
            .await?
            .ok_or_else(|| EngineError::not_found("execution", execution_id))
    }

    /// Most recent executions of a workflow, newest first.
    pub async fn history(
        &self,
        workflow_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Execution>, EngineError> {
        self.executions
            .get_by_workflow_id(workflow_id, HistoryWindow::latest(limit))
            .await
    }

    /// Request cancellation of a non-terminal execution.
    ///
    /// The stored row is flipped to `Cancelled` first, so [`Governor::status`]
    /// reports the cancellation as soon as this returns. A run executing in
    /// this process is then signalled and stops before its next node.
    ///
    /// # Errors
    /// [`EngineError::ExecutionFinalized`] if the execution already ended.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<CancelOutcome, EngineError> {
        let execution = self.status(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::ExecutionFinalized(execution_id));
        }

        self.executions
            .update(
                execution_id,
                ExecutionUpdate {
                    status: Some(ExecutionStatus::Cancelled),
                    completed_at: Some(self.clock.now()),
                    ..ExecutionUpdate::default()
                },
            )
            .await?;

        if self.orchestrator.cancel_local(execution_id) {
            info!(%execution_id, "execution marked cancelled and signalled");
            return Ok(CancelOutcome::Signalled);
        }

        info!(%execution_id, "execution marked cancelled");
        Ok(CancelOutcome::Recorded)
    }

    pub async fn circuit_stats(&self, workflow_id: Uuid) -> Result<CircuitStats, EngineError> {
        self.breaker.stats(&Self::workflow_service(workflow_id)).await
    }
}

/// `null`, `{}` or a definition with no nodes and no edges.
fn is_empty_definition(definition: &Value) -> bool {
    let empty = |key: &str, obj: &Map<String, Value>| match obj.get(key) {
        None | Some(Value::Null) => true,
        Some(Value::Array(items)) => items.is_empty(),
        Some(_) => false,
    };
    match definition {
        Value::Null => true,
        Value::Object(obj) => empty("nodes", obj) && empty("edges", obj),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_definitions() {
        assert!(is_empty_definition(&Value::Null));
        assert!(is_empty_definition(&json!({})));
        assert!(is_empty_definition(&json!({ "nodes": [], "edges": [] })));
        assert!(!is_empty_definition(&json!({ "nodes": [{ "id": "t" }] })));
        assert!(!is_empty_definition(&json!("not an object")));
    }
}
