//! Job worker.
//!
//! Pulls one job at a time from a [`JobSource`] and runs it through
//! [`Governor::run_job`], which re-admits the run before executing it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use engine::{EngineError, ExecutionStatus, Governor};

use crate::{JobSource, JobStatus, QueueError, QueuedJob};

/// What happened to the job handled by [`Worker::process_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The run executed; its own status may still be `Failed`.
    Executed {
        job_id: Uuid,
        execution_id: Uuid,
        status: ExecutionStatus,
    },
    /// Delivery failed and the job went back to the queue.
    Requeued { job_id: Uuid },
    DeadLettered { job_id: Uuid },
}

pub struct Worker {
    source: Arc<dyn JobSource>,
    governor: Arc<Governor>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(source: Arc<dyn JobSource>, governor: Arc<Governor>, poll_interval: Duration) -> Self {
        Self {
            source,
            governor,
            poll_interval,
        }
    }

    /// Handle one job if any is pending.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.source.fetch_next().await? else {
            return Ok(None);
        };
        self.handle(job).await.map(Some)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, workflow_id = %job.descriptor.workflow_id, attempt = job.attempts))]
    async fn handle(&self, job: QueuedJob) -> Result<JobOutcome, QueueError> {
        let job_id = job.id;

        match self.governor.run_job(job.descriptor).await {
            Ok(result) => {
                self.source.complete(job_id).await?;
                info!(execution_id = %result.execution_id, status = %result.status, "job executed");
                Ok(JobOutcome::Executed {
                    job_id,
                    execution_id: result.execution_id,
                    status: result.status,
                })
            }
            Err(e) => {
                let retry = is_transient(&e);
                warn!(error = %e, retry, "job failed");
                match self.source.fail(job_id, &e.to_string(), retry).await? {
                    JobStatus::Pending => Ok(JobOutcome::Requeued { job_id }),
                    _ => Ok(JobOutcome::DeadLettered { job_id }),
                }
            }
        }
    }

    /// Drain the source until `shutdown` is cancelled, sleeping
    /// `poll_interval` whenever it is empty.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(poll_interval = ?self.poll_interval, "worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(error = %e, "failed to process job"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("worker shutting down");
    }
}

/// Refusals that may clear up on their own are worth another delivery.
fn is_transient(err: &EngineError) -> bool {
    matches!(
        err,
        EngineError::Admission(_)
            | EngineError::CircuitOpen { .. }
            | EngineError::Store(_)
            | EngineError::System(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryQueue;
    use engine::clock::SystemClock;
    use engine::config::EngineConfig;
    use engine::memory::{MemoryCache, MemoryExecutionStore, MemoryWorkflowStore};
    use engine::models::{RunOptions, WorkflowRecord};
    use engine::probe::FixedProbe;
    use engine::store::{AsyncDispatcher, JobDescriptor};
    use nodes::mock::MockExecutor;
    use nodes::NodeRegistry;
    use serde_json::json;

    struct Setup {
        queue: Arc<MemoryQueue>,
        workflows: Arc<MemoryWorkflowStore>,
        governor: Arc<Governor>,
    }

    fn setup() -> Setup {
        let queue = Arc::new(MemoryQueue::new(2));
        let workflows = Arc::new(MemoryWorkflowStore::new());
        let registry = NodeRegistry::new().with(
            "greet",
            Arc::new(MockExecutor::returning("greet", json!({ "greeted": true }))),
        );
        let governor = Governor::new(
            EngineConfig::default(),
            workflows.clone(),
            Arc::new(MemoryExecutionStore::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(registry),
            Arc::new(FixedProbe::default()),
            Arc::new(SystemClock),
        )
        .with_dispatcher(queue.clone());

        Setup {
            queue,
            workflows,
            governor: Arc::new(governor),
        }
    }

    fn definition() -> serde_json::Value {
        json!({
            "nodes": [
                { "id": "T", "type": "trigger" },
                { "id": "G", "type": "action", "data": { "action_type": "greet" } },
            ],
            "edges": [ { "source": "T", "target": "G" } ],
        })
    }

    #[tokio::test]
    async fn submitted_jobs_are_executed() {
        let s = setup();
        let workflow_id = s.workflows.insert(WorkflowRecord::new("greeter", definition()));
        let job_id = s
            .governor
            .submit(workflow_id, Default::default(), RunOptions::for_user(1))
            .await
            .unwrap();

        let worker = Worker::new(s.queue.clone(), s.governor.clone(), Duration::from_millis(10));
        let outcome = worker.process_next().await.unwrap().expect("a job was pending");

        let JobOutcome::Executed { execution_id, status, .. } = outcome else {
            panic!("expected execution, got {outcome:?}");
        };
        assert_eq!(status, ExecutionStatus::Completed);
        assert_eq!(s.governor.status(execution_id).await.unwrap().status, ExecutionStatus::Completed);
        assert_eq!(s.queue.job(job_id).unwrap().status, JobStatus::Completed);
        assert!(worker.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn jobs_for_deactivated_workflows_are_dead_lettered() {
        let s = setup();
        let mut record = WorkflowRecord::new("gone", definition());
        record.is_active = false;
        let workflow_id = s.workflows.insert(record);

        let job_id = s
            .queue
            .enqueue(JobDescriptor {
                workflow_id,
                payload: Default::default(),
                options: RunOptions::default(),
            })
            .await
            .unwrap();

        let worker = Worker::new(s.queue.clone(), s.governor.clone(), Duration::from_millis(10));
        let outcome = worker.process_next().await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::DeadLettered { job_id }));
        assert!(s.queue.job(job_id).unwrap().last_error.unwrap().contains("not active"));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let s = setup();
        let worker = Worker::new(s.queue.clone(), s.governor.clone(), Duration::from_millis(5));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), worker.run(shutdown))
            .await
            .expect("worker exits once cancelled");
    }

    #[test]
    fn transient_errors() {
        assert!(is_transient(&EngineError::Admission(vec!["busy".into()])));
        assert!(!is_transient(&EngineError::Validation(vec!["bad".into()])));
        assert!(!is_transient(&EngineError::WorkflowInactive(Uuid::nil())));
    }
}
