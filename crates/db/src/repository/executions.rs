//! Execution persistence.
//!
//! Terminal rows are immutable: every update is guarded by a status filter,
//! so a run finalized (or cancelled) by another process is never overwritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use engine::models::{Execution, ExecutionUpdate, NewExecution};
use engine::store::{ExecutionStore, HistoryWindow};
use engine::EngineError;

use crate::{
    DbError, DbPool,
    models::{ExecutionRow, EXECUTION_COLUMNS},
};

fn to_json<T: Serialize>(column: &'static str, value: &T) -> Result<Value, DbError> {
    serde_json::to_value(value).map_err(|e| DbError::decode(column, e))
}

/// Open a new execution row.
pub async fn create_execution(pool: &PgPool, new: &NewExecution) -> Result<ExecutionRow, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    let sql = format!(
        "INSERT INTO workflow_executions (id, workflow_id, user_id, status, payload, started_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING {EXECUTION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(id)
        .bind(new.workflow_id)
        .bind(new.user_id)
        .bind(new.status.as_str())
        .bind(to_json("payload", &new.payload)?)
        .bind(now)
        .fetch_one(pool)
        .await?;

    Ok(row)
}

pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<ExecutionRow, DbError> {
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM workflow_executions WHERE id = $1");
    let row = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Apply a partial update to a non-terminal execution.
///
/// Returns `Ok(None)` when the row exists but is already terminal.
pub async fn update_execution(
    pool: &PgPool,
    id: Uuid,
    update: &ExecutionUpdate,
) -> Result<Option<ExecutionRow>, DbError> {
    let processed_nodes = update
        .processed_nodes
        .as_ref()
        .map(|v| to_json("processed_nodes", v))
        .transpose()?;
    let results = update.results.as_ref().map(|v| to_json("results", v)).transpose()?;
    let errors = update.errors.as_ref().map(|v| to_json("errors", v)).transpose()?;

    let sql = format!(
        "UPDATE workflow_executions SET \
             status            = COALESCE($2, status), \
             completed_at      = COALESCE($3, completed_at), \
             execution_time_ms = COALESCE($4, execution_time_ms), \
             processed_nodes   = COALESCE($5, processed_nodes), \
             results           = COALESCE($6, results), \
             errors            = COALESCE($7, errors), \
             error             = COALESCE($8, error) \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled') \
         RETURNING {EXECUTION_COLUMNS}"
    );
    let row = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(id)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.completed_at)
        .bind(update.execution_time_ms)
        .bind(processed_nodes)
        .bind(results)
        .bind(errors)
        .bind(update.error.as_deref())
        .fetch_optional(pool)
        .await?;

    if row.is_none() {
        // Distinguish a missing row from a finalized one.
        get_execution(pool, id).await?;
    }

    Ok(row)
}

/// Executions of one workflow inside `window`, newest first.
pub async fn list_executions(
    pool: &PgPool,
    workflow_id: Uuid,
    window: HistoryWindow,
) -> Result<Vec<ExecutionRow>, DbError> {
    let limit = window.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));

    let sql = format!(
        "SELECT {EXECUTION_COLUMNS} FROM workflow_executions \
         WHERE workflow_id = $1 \
           AND ($2::timestamptz IS NULL OR started_at >= $2) \
           AND ($3::timestamptz IS NULL OR started_at <= $3) \
         ORDER BY started_at DESC \
         LIMIT $4"
    );
    let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(workflow_id)
        .bind(window.since)
        .bind(window.until)
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// `Running` executions for `user_id`; `None` counts the anonymous bucket.
pub async fn count_running(pool: &PgPool, user_id: Option<i64>) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM workflow_executions \
         WHERE user_id IS NOT DISTINCT FROM $1 AND status = 'running'",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

pub async fn count_started_since(
    pool: &PgPool,
    user_id: Option<i64>,
    since: DateTime<Utc>,
) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM workflow_executions \
         WHERE user_id IS NOT DISTINCT FROM $1 AND started_at >= $2",
    )
    .bind(user_id)
    .bind(since)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// [`ExecutionStore`] over the `workflow_executions` table.
#[derive(Debug, Clone)]
pub struct PgExecutionStore {
    pool: DbPool,
}

impl PgExecutionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn create(&self, new: NewExecution) -> Result<Execution, EngineError> {
        let row = create_execution(&self.pool, &new).await?;
        debug!(execution_id = %row.id, workflow_id = %row.workflow_id, "execution row created");
        Ok(row.try_into()?)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Execution>, EngineError> {
        match get_execution(&self.pool, id).await {
            Ok(row) => Ok(Some(row.try_into()?)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, id: Uuid, update: ExecutionUpdate) -> Result<Execution, EngineError> {
        match update_execution(&self.pool, id, &update).await {
            Ok(Some(row)) => Ok(row.try_into()?),
            Ok(None) => Err(EngineError::ExecutionFinalized(id)),
            Err(DbError::NotFound) => Err(EngineError::not_found("execution", id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_workflow_id(
        &self,
        workflow_id: Uuid,
        window: HistoryWindow,
    ) -> Result<Vec<Execution>, EngineError> {
        let rows = list_executions(&self.pool, workflow_id, window).await?;
        rows.into_iter()
            .map(|row| Execution::try_from(row).map_err(EngineError::from))
            .collect()
    }

    async fn count_running(&self, user_id: Option<i64>) -> Result<u64, EngineError> {
        Ok(count(count_running(&self.pool, user_id).await?))
    }

    async fn count_started_since(
        &self,
        user_id: Option<i64>,
        since: DateTime<Utc>,
    ) -> Result<u64, EngineError> {
        Ok(count(count_started_since(&self.pool, user_id, since).await?))
    }
}
