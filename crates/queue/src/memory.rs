//! In-process job queue.
//!
//! FIFO over pending jobs. Retried jobs go to the back of the line.
//! Completed and dead-lettered jobs stay inspectable until `retain_settled`
//! newer ones have settled after them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use engine::store::{AsyncDispatcher, JobDescriptor, JobId};
use engine::EngineError;

use crate::{JobSource, JobStatus, QueueError, QueuedJob};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETAIN_SETTLED: usize = 1000;

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<JobId>,
    jobs: HashMap<JobId, QueuedJob>,
    settled: VecDeque<JobId>,
}

impl State {
    fn settle(&mut self, id: JobId, retain: usize) {
        self.settled.push_back(id);
        while self.settled.len() > retain {
            if let Some(oldest) = self.settled.pop_front() {
                self.jobs.remove(&oldest);
                debug!(id = %oldest, "settled job pruned");
            }
        }
    }
}

#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    max_attempts: u32,
    retain_settled: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl MemoryQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_attempts: max_attempts.max(1),
            retain_settled: DEFAULT_RETAIN_SETTLED,
        }
    }

    /// Cap on how many settled jobs are kept for `job` lookups.
    pub fn with_retention(mut self, retain_settled: usize) -> Self {
        self.retain_settled = retain_settled;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, descriptor: JobDescriptor) -> JobId {
        let job = QueuedJob::new(descriptor, self.max_attempts);
        let id = job.id;
        let mut state = self.lock();
        state.pending.push_back(id);
        state.jobs.insert(id, job);
        id
    }

    pub fn job(&self, id: JobId) -> Option<QueuedJob> {
        self.lock().jobs.get(&id).cloned()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }
}

#[async_trait]
impl AsyncDispatcher for MemoryQueue {
    async fn enqueue(&self, job: JobDescriptor) -> Result<JobId, EngineError> {
        let workflow_id = job.workflow_id;
        let id = self.push(job);
        debug!(%id, %workflow_id, "job enqueued");
        Ok(id)
    }
}

#[async_trait]
impl JobSource for MemoryQueue {
    async fn fetch_next(&self) -> Result<Option<QueuedJob>, QueueError> {
        let mut state = self.lock();
        let Some(id) = state.pending.pop_front() else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
        job.status = JobStatus::Processing;
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        let mut state = self.lock();
        let job = processing(&mut state, id)?;
        job.status = JobStatus::Completed;
        state.settle(id, self.retain_settled);
        Ok(())
    }

    async fn fail(&self, id: JobId, error: &str, retry: bool) -> Result<JobStatus, QueueError> {
        let mut state = self.lock();
        let job = processing(&mut state, id)?;
        job.last_error = Some(error.to_string());

        if retry && job.attempts < job.max_attempts {
            job.status = JobStatus::Pending;
            info!(%id, attempts = job.attempts, "job requeued");
            state.pending.push_back(id);
            Ok(JobStatus::Pending)
        } else {
            job.status = JobStatus::DeadLettered;
            warn!(%id, attempts = job.attempts, error, "job dead-lettered");
            state.settle(id, self.retain_settled);
            Ok(JobStatus::DeadLettered)
        }
    }
}

fn processing(state: &mut State, id: JobId) -> Result<&mut QueuedJob, QueueError> {
    let job = state.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
    if job.status != JobStatus::Processing {
        return Err(QueueError::NotProcessing {
            id,
            status: job.status.to_string(),
        });
    }
    Ok(job)
}
