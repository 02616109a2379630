//! Workflow traversal.
//!
//! `Orchestrator` runs one admitted workflow:
//! 1. Opens an execution row in `Running` status and seeds the context with
//!    the payload.
//! 2. Walks the graph breadth-first from every start node, consulting the
//!    circuit breaker (keyed by node type) before each dispatch.
//! 3. Merges each successful node's output into the context and enqueues its
//!    successors. A failed node is recorded in `errors` and its successors
//!    are not enqueued from it.
//! 4. Persists the final status, timings and result/error maps.
//!
//! Only [`crate::governance::Governor`] can produce the [`RunTicket`] that
//! `run` requires.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use nodes::{ExecutionSubject, NodeError, NodeExecutor, NodeExecutorFactory};

use crate::circuit::{CircuitBreaker, CircuitError, CircuitThresholds};
use crate::clock::Clock;
use crate::condition;
use crate::config::ExecutionConfig;
use crate::governance::RunTicket;
use crate::models::{
    Context, ExecutionResult, ExecutionStatus, ExecutionUpdate, NewExecution, NodeDefinition,
    NodeKind, NodeResult, WorkflowDefinition,
};
use crate::store::ExecutionStore;
use crate::validator::{adjacency, numeric, start_nodes};
use crate::EngineError;

/// Longest exponent used for retry back-off.
const MAX_BACKOFF_DOUBLINGS: u32 = 10;

/// What one node dispatch produced.
enum Step {
    Done { output: Map<String, Value>, message: String },
    /// The run was cancelled while the node was waiting.
    Interrupted,
}

/// Accumulated state of one traversal.
#[derive(Default)]
struct Traversal {
    context: Context,
    processed: Vec<String>,
    results: BTreeMap<String, NodeResult>,
    errors: BTreeMap<String, String>,
    cancelled: bool,
}

pub struct Orchestrator {
    executions: Arc<dyn ExecutionStore>,
    factory: Arc<dyn NodeExecutorFactory>,
    breaker: Arc<CircuitBreaker>,
    thresholds: CircuitThresholds,
    config: ExecutionConfig,
    clock: Arc<dyn Clock>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        factory: Arc<dyn NodeExecutorFactory>,
        breaker: Arc<CircuitBreaker>,
        thresholds: CircuitThresholds,
        config: ExecutionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executions,
            factory,
            breaker,
            thresholds,
            config,
            clock,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Trip the cancellation token of a run executing in this process.
    /// Returns `false` if no such run is in flight here.
    pub fn cancel_local(&self, execution_id: Uuid) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        match running.get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, execution_id: Uuid) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&execution_id)
    }

    fn register(&self, execution_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(execution_id, token.clone());
        token
    }

    fn unregister(&self, execution_id: Uuid) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&execution_id);
    }

    /// Execute an admitted run to completion.
    ///
    /// Node failures are contained in the returned result. `Err` means the
    /// execution row could not be created, or an unexpected failure occurred
    /// after it was; in the latter case the row is marked `Failed`.
    #[instrument(skip(self, ticket), fields(workflow_id = %ticket.workflow.id))]
    pub async fn run(&self, ticket: RunTicket) -> Result<ExecutionResult, EngineError> {
        let RunTicket {
            workflow,
            definition,
            payload,
            options,
        } = ticket;

        let execution = self
            .executions
            .create(NewExecution {
                workflow_id: workflow.id,
                user_id: options.user_id,
                status: ExecutionStatus::Running,
                payload: payload.clone(),
            })
            .await?;
        let execution_id = execution.id;
        info!(%execution_id, nodes = definition.nodes.len(), "execution started");

        let started = Instant::now();
        let token = self.register(execution_id);
        let max_retries = self.config.retry_budget(options.max_retries);
        if options.max_retries.is_some_and(|n| n > i64::from(max_retries)) {
            warn!(
                %execution_id,
                requested = ?options.max_retries,
                max_retries,
                "retry override capped"
            );
        }

        let outcome = self
            .traverse(execution_id, &definition, payload, max_retries, &token)
            .await;
        self.unregister(execution_id);
        let elapsed_ms = elapsed_ms(started);

        let traversal = match outcome {
            Ok(traversal) => traversal,
            Err(e) => {
                error!(%execution_id, error = %e, "execution aborted by system error");
                let update = ExecutionUpdate {
                    status: Some(ExecutionStatus::Failed),
                    completed_at: Some(self.clock.now()),
                    execution_time_ms: Some(elapsed_ms),
                    error: Some(e.to_string()),
                    ..ExecutionUpdate::default()
                };
                if let Err(persist) = self.executions.update(execution_id, update).await {
                    error!(%execution_id, error = %persist, "failed to record system error");
                }
                return Err(match e {
                    EngineError::System(_) => e,
                    other => EngineError::System(other.to_string()),
                });
            }
        };

        let mut status = if traversal.cancelled {
            ExecutionStatus::Cancelled
        } else if traversal.errors.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };

        let update = ExecutionUpdate {
            status: Some(status),
            completed_at: Some(self.clock.now()),
            execution_time_ms: Some(elapsed_ms),
            processed_nodes: Some(traversal.processed.clone()),
            results: Some(traversal.results.clone()),
            errors: Some(traversal.errors.clone()),
            error: None,
        };
        match self.executions.update(execution_id, update).await {
            Ok(_) => {}
            Err(EngineError::ExecutionFinalized(_)) => {
                // Finalized by someone else while we ran (external cancel).
                if let Some(stored) = self.executions.find(execution_id).await? {
                    info!(%execution_id, status = %stored.status, "execution finalized externally");
                    status = stored.status;
                }
            }
            Err(e) => {
                error!(%execution_id, error = %e, "failed to persist execution outcome");
                return Err(EngineError::System(e.to_string()));
            }
        }

        info!(
            %execution_id,
            %status,
            processed = traversal.processed.len(),
            failed = traversal.errors.len(),
            elapsed_ms,
            "execution finished"
        );

        Ok(ExecutionResult {
            execution_id,
            status,
            success: status == ExecutionStatus::Completed,
            results: traversal.results,
            errors: traversal.errors,
            processed_nodes: traversal.processed,
            context: traversal.context,
            execution_time_ms: elapsed_ms,
        })
    }

    // -----------------------------------------------------------------------
    // Internal: traversal.
    // -----------------------------------------------------------------------

    async fn traverse(
        &self,
        execution_id: Uuid,
        definition: &WorkflowDefinition,
        payload: Context,
        max_retries: u32,
        token: &CancellationToken,
    ) -> Result<Traversal, EngineError> {
        let by_id: HashMap<&str, &NodeDefinition> =
            definition.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let successors = adjacency(definition);

        let mut run = Traversal {
            context: payload,
            ..Traversal::default()
        };
        let mut queue: VecDeque<&NodeDefinition> = start_nodes(definition).collect();
        let mut visited: HashSet<&str> = HashSet::new();

        while let Some(node) = queue.pop_front() {
            if token.is_cancelled() {
                info!(%execution_id, "cancellation observed, stopping traversal");
                run.cancelled = true;
                break;
            }
            // A node is attempted at most once, whatever its outcome.
            if !visited.insert(node.id.as_str()) {
                continue;
            }

            let subject = ExecutionSubject::from_context(&run.context);
            // An interrupted node says nothing about the health of its type.
            let attempt = self
                .breaker
                .execute_unless(
                    &node.node_type,
                    self.thresholds,
                    || self.dispatch(node, &run.context, &subject, max_retries, token),
                    |step| matches!(step, Step::Interrupted),
                )
                .await;

            match attempt {
                Ok(Step::Done { output, message }) => {
                    debug!(%execution_id, node_id = %node.id, node_type = %node.node_type, "node succeeded");
                    run.context.extend(output.clone());
                    run.results.insert(node.id.clone(), NodeResult { output, message });
                    run.processed.push(node.id.clone());

                    for next in successors.get(node.id.as_str()).into_iter().flatten() {
                        if let Some(&next) = by_id.get(next) {
                            queue.push_back(next);
                        }
                    }
                }
                Ok(Step::Interrupted) => {
                    info!(%execution_id, node_id = %node.id, "node interrupted by cancellation");
                    run.cancelled = true;
                    break;
                }
                Err(CircuitError::Open { service }) => {
                    warn!(%execution_id, node_id = %node.id, %service, "node skipped, circuit open");
                    run.errors.insert(
                        node.id.clone(),
                        format!("Circuit breaker is open for node type '{service}'"),
                    );
                }
                Err(CircuitError::Inner(e)) => {
                    warn!(
                        %execution_id,
                        node_id = %node.id,
                        node_type = %node.node_type,
                        error = %e,
                        "node failed"
                    );
                    run.errors.insert(node.id.clone(), e.to_string());
                }
                Err(CircuitError::State(e)) => return Err(e),
            }
        }

        Ok(run)
    }

    async fn dispatch(
        &self,
        node: &NodeDefinition,
        ctx: &Context,
        subject: &ExecutionSubject,
        max_retries: u32,
        token: &CancellationToken,
    ) -> Result<Step, NodeError> {
        let Some(kind) = node.kind() else {
            return Err(NodeError::Fatal(format!("unknown node type '{}'", node.node_type)));
        };

        match kind {
            NodeKind::Trigger | NodeKind::Start => Ok(Step::Done {
                output: Map::new(),
                message: format!("{kind} node passed through"),
            }),

            NodeKind::Condition => {
                let field = text(&node.data, "field")
                    .or_else(|| text(&node.data, "condition"))
                    .unwrap_or_default();
                let operator = text(&node.data, "operator").unwrap_or_default();
                let expected = node.data.get("value").unwrap_or(&Value::Null);
                let outcome = condition::evaluate(ctx, field, operator, expected);

                let mut output = Map::new();
                output.insert("condition_result".into(), Value::Bool(outcome));
                Ok(Step::Done {
                    output,
                    message: format!("Condition '{field} {operator}' evaluated to {outcome}"),
                })
            }

            NodeKind::Delay => {
                let secs = numeric(node, "delay").unwrap_or(0.0);
                let wait = Duration::try_from_secs_f64(secs)
                    .map_err(|e| NodeError::Fatal(format!("invalid delay {secs}: {e}")))?;

                tokio::select! {
                    _ = tokio::time::sleep(wait) => Ok(Step::Done {
                        output: Map::new(),
                        message: format!("Delayed for {secs}s"),
                    }),
                    _ = token.cancelled() => Ok(Step::Interrupted),
                }
            }

            NodeKind::Action => {
                let action_type = text(&node.data, "action_type")
                    .or_else(|| text(&node.data, "type"))
                    .unwrap_or("unknown");
                match self.factory.create(action_type) {
                    Ok(executor) => {
                        self.execute_with_retry(node, executor.as_ref(), subject, ctx, max_retries)
                            .await
                    }
                    Err(NodeError::NotFound(_)) => {
                        warn!(node_id = %node.id, action_type, "no executor for action, skipping");
                        Ok(Step::Done {
                            output: Map::new(),
                            message: format!("No executor for action '{action_type}', skipped"),
                        })
                    }
                    Err(e) => Err(e),
                }
            }

            NodeKind::Webhook
            | NodeKind::AiGenerate
            | NodeKind::SocialPublish
            | NodeKind::EmailSend
            | NodeKind::DataTransform => {
                let executor = self.factory.create(executor_key(kind, &node.data))?;
                self.execute_with_retry(node, executor.as_ref(), subject, ctx, max_retries)
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single executor call with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        node: &NodeDefinition,
        executor: &dyn NodeExecutor,
        subject: &ExecutionSubject,
        ctx: &Context,
        max_retries: u32,
    ) -> Result<Step, NodeError> {
        let mut attempts = 0u32;

        loop {
            match executor.execute(&node.data, subject, ctx).await {
                Ok(output) => {
                    return Ok(Step::Done {
                        message: format!("{} node executed", node.node_type),
                        output,
                    })
                }

                Err(e) if e.is_retryable() && attempts < max_retries => {
                    attempts += 1;
                    let delay = self.config.retry_base_delay()
                        * 2u32.pow((attempts - 1).min(MAX_BACKOFF_DOUBLINGS));

                    warn!(
                        node_id = %node.id,
                        attempt = attempts,
                        max_retries,
                        ?delay,
                        error = %e,
                        "retryable node error, backing off"
                    );

                    tokio::time::sleep(delay).await;
                }

                Err(e) => return Err(e),
            }
        }
    }
}

/// Executor lookup key for kinds backed by a [`NodeExecutor`].
fn executor_key(kind: NodeKind, data: &Map<String, Value>) -> &'static str {
    match kind {
        NodeKind::Webhook => "custom_webhook",
        NodeKind::AiGenerate => "ai_generate_text",
        NodeKind::SocialPublish if text(data, "platform") == Some("facebook") => {
            "publish_social_post_immediately"
        }
        NodeKind::SocialPublish => "schedule_social_post",
        NodeKind::EmailSend => "send_email",
        NodeKind::DataTransform => "transform_data",
        NodeKind::Trigger
        | NodeKind::Start
        | NodeKind::Action
        | NodeKind::Condition
        | NodeKind::Delay => kind.as_str(),
    }
}

fn text<'a>(data: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
