//! Collaborator contracts the engine consumes.
//!
//! Persistence, caching and job dispatch are implemented elsewhere (the `db`
//! and `queue` crates, or [`crate::memory`] for tests and single-process
//! runs). The engine only ever talks to these traits.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::models::{Context, Execution, ExecutionUpdate, NewExecution, RunOptions, WorkflowRecord};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn find(&self, id: Uuid) -> Result<Option<WorkflowRecord>, EngineError>;

    async fn find_or_fail(&self, id: Uuid) -> Result<WorkflowRecord, EngineError> {
        self.find(id)
            .await?
            .ok_or_else(|| EngineError::not_found("workflow", id))
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Time/size window for history queries. Results are newest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryWindow {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            until: Some(until),
            limit: None,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| at >= s) && self.until.map_or(true, |u| at <= u)
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, new: NewExecution) -> Result<Execution, EngineError>;

    async fn find(&self, id: Uuid) -> Result<Option<Execution>, EngineError>;

    /// Apply `update` to a non-terminal execution.
    ///
    /// # Errors
    /// [`EngineError::ExecutionFinalized`] if the row is already terminal.
    async fn update(&self, id: Uuid, update: ExecutionUpdate) -> Result<Execution, EngineError>;

    async fn get_by_workflow_id(
        &self,
        workflow_id: Uuid,
        window: HistoryWindow,
    ) -> Result<Vec<Execution>, EngineError>;

    /// Executions currently `Running` for this user (`None` = anonymous bucket).
    async fn count_running(&self, user_id: Option<i64>) -> Result<u64, EngineError>;

    /// Executions started at or after `since` for this user.
    async fn count_started_since(
        &self,
        user_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<u64, EngineError>;
}

// ---------------------------------------------------------------------------
// Keyed cache
// ---------------------------------------------------------------------------

/// Shared TTL key-value store backing circuit state and quota memoization.
#[async_trait]
pub trait KeyedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError>;

    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), EngineError>;

    async fn forget(&self, key: &str) -> Result<(), EngineError>;

    /// Store `new` only if the live value equals `expected` (`None` = absent).
    /// Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
        ttl: Duration,
    ) -> Result<bool, EngineError>;

    async fn get_or(&self, key: &str, default: Value) -> Result<Value, EngineError> {
        Ok(self.get(key).await?.unwrap_or(default))
    }
}

/// Return the cached value under `key`, or compute, store and return it.
///
/// A cached value that no longer deserializes into `T` is recomputed.
pub async fn remember<T, F, Fut>(
    cache: &dyn KeyedCache,
    key: &str,
    ttl: Duration,
    compute: F,
) -> Result<T, EngineError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    if let Some(cached) = cache.get(key).await? {
        match serde_json::from_value(cached) {
            Ok(value) => return Ok(value),
            Err(e) => debug!(key, error = %e, "discarding undecodable cache entry"),
        }
    }

    let value = compute().await?;
    let encoded = serde_json::to_value(&value).map_err(|e| EngineError::Store(e.to_string()))?;
    cache.put(key, encoded, ttl).await?;
    Ok(value)
}

// ---------------------------------------------------------------------------
// Async dispatch
// ---------------------------------------------------------------------------

pub type JobId = Uuid;

/// Everything a worker needs to re-run admission and execute later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub workflow_id: Uuid,
    pub payload: Context,
    pub options: RunOptions,
}

#[async_trait]
pub trait AsyncDispatcher: Send + Sync {
    async fn enqueue(&self, job: JobDescriptor) -> Result<JobId, EngineError>;
}
