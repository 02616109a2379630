//! In-memory collaborator implementations.
//!
//! Used by the test suites and by single-process runs (`flowgate run`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::models::{Execution, ExecutionStatus, ExecutionUpdate, NewExecution, WorkflowRecord};
use crate::store::{ExecutionStore, HistoryWindow, KeyedCache, WorkflowStore};
use crate::EngineError;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, EngineError> {
    mutex
        .lock()
        .map_err(|_| EngineError::Store("in-memory store lock poisoned".into()))
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    workflows: RwLock<HashMap<Uuid, WorkflowRecord>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workflow: WorkflowRecord) -> Uuid {
        let id = workflow.id;
        self.workflows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, workflow);
        id
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn find(&self, id: Uuid) -> Result<Option<WorkflowRecord>, EngineError> {
        let workflows = self
            .workflows
            .read()
            .map_err(|_| EngineError::Store("in-memory store lock poisoned".into()))?;
        Ok(workflows.get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct MemoryExecutionStore {
    executions: Mutex<HashMap<Uuid, Execution>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryExecutionStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Seed a pre-built execution (history fixtures, quota tests).
    pub fn insert(&self, execution: Execution) {
        if let Ok(mut executions) = lock(&self.executions) {
            executions.insert(execution.id, execution);
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.executions).map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, new: NewExecution) -> Result<Execution, EngineError> {
        let execution = Execution {
            id: Uuid::new_v4(),
            workflow_id: new.workflow_id,
            user_id: new.user_id,
            status: new.status,
            payload: new.payload,
            started_at: self.clock.now(),
            completed_at: None,
            execution_time_ms: None,
            processed_nodes: Vec::new(),
            results: Default::default(),
            errors: Default::default(),
            error: None,
        };
        lock(&self.executions)?.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Execution>, EngineError> {
        Ok(lock(&self.executions)?.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, update: ExecutionUpdate) -> Result<Execution, EngineError> {
        let mut executions = lock(&self.executions)?;
        let execution = executions
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("execution", id))?;

        if execution.status.is_terminal() {
            return Err(EngineError::ExecutionFinalized(id));
        }

        update.apply_to(execution);
        Ok(execution.clone())
    }

    async fn get_by_workflow_id(
        &self,
        workflow_id: Uuid,
        window: HistoryWindow,
    ) -> Result<Vec<Execution>, EngineError> {
        let mut matching: Vec<Execution> = lock(&self.executions)?
            .values()
            .filter(|e| e.workflow_id == workflow_id && window.contains(e.started_at))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = window.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn count_running(&self, user_id: Option<i64>) -> Result<u64, EngineError> {
        Ok(lock(&self.executions)?
            .values()
            .filter(|e| e.user_id == user_id && e.status == ExecutionStatus::Running)
            .count() as u64)
    }

    async fn count_started_since(
        &self,
        user_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        Ok(lock(&self.executions)?
            .values()
            .filter(|e| e.user_id == user_id && e.started_at >= since)
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Keyed cache
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// TTL cache with every operation serialized under one lock, which makes
/// `compare_and_swap` genuinely atomic.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entries: &'a mut HashMap<String, CacheEntry>, key: &str) -> Option<&'a Value> {
        let expired = entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if expired {
            entries.remove(key);
        }
        entries.get(key).map(|entry| &entry.value)
    }

    fn entry(value: Value, ttl: Duration) -> CacheEntry {
        CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        }
    }
}

#[async_trait]
impl KeyedCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        let mut entries = lock(&self.entries)?;
        Ok(Self::live(&mut entries, key).cloned())
    }

    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), EngineError> {
        lock(&self.entries)?.insert(key.to_string(), Self::entry(value, ttl));
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<(), EngineError> {
        lock(&self.entries)?.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&Value>,
        new: Value,
        ttl: Duration,
    ) -> Result<bool, EngineError> {
        let mut entries = lock(&self.entries)?;
        if Self::live(&mut entries, key) != expected {
            return Ok(false);
        }
        entries.insert(key.to_string(), Self::entry(new, ttl));
        Ok(true)
    }
}
