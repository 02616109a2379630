//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models and carry no domain behaviour. Each row
//! converts into its domain type from the `engine` or `queue` crate, failing
//! with [`DbError::Decode`] when a stored column no longer fits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use engine::models::{Execution, WorkflowRecord};
use queue::{JobStatus, QueuedJob};

use crate::DbError;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// Full JSON workflow definition (nodes, edges, required_fields)
    pub definition: Value,
    pub is_active: bool,
    pub timeout_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for WorkflowRecord {
    type Error = DbError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let timeout_secs = row
            .timeout_secs
            .map(u64::try_from)
            .transpose()
            .map_err(|e| DbError::decode("timeout_secs", e))?;

        Ok(Self {
            id: row.id,
            name: row.name,
            definition: row.definition,
            is_active: row.is_active,
            timeout_secs,
            created_at: row.created_at,
        })
    }
}

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

/// A persisted workflow execution row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Option<i64>,
    pub status: String,
    pub payload: Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub processed_nodes: Value,
    pub results: Value,
    pub errors: Value,
    pub error: Option<String>,
}

/// Column list shared by every query that returns an [`ExecutionRow`].
pub(crate) const EXECUTION_COLUMNS: &str = "id, workflow_id, user_id, status, payload, started_at, \
     completed_at, execution_time_ms, processed_nodes, results, errors, error";

fn json_column<T: serde::de::DeserializeOwned>(column: &'static str, value: Value) -> Result<T, DbError> {
    serde_json::from_value(value).map_err(|e| DbError::decode(column, e))
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = DbError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            user_id: row.user_id,
            status: row.status.parse().map_err(|e| DbError::decode("status", e))?,
            payload: json_column("payload", row.payload)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            execution_time_ms: row.execution_time_ms,
            processed_nodes: json_column("processed_nodes", row.processed_nodes)?,
            results: json_column("results", row.results)?,
            errors: json_column("errors", row.errors)?,
            error: row.error,
        })
    }
}

// ---------------------------------------------------------------------------
// job_queue
// ---------------------------------------------------------------------------

/// A job row fetched from the queue table.
///
/// `payload` holds the serialized `JobDescriptor`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub payload: Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const JOB_COLUMNS: &str =
    "id, workflow_id, status, attempts, max_attempts, payload, last_error, created_at, updated_at";

impl TryFrom<JobRow> for QueuedJob {
    type Error = DbError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            descriptor: json_column("payload", row.payload)?,
            status: row.status.parse::<JobStatus>().map_err(|e| DbError::decode("status", e))?,
            attempts: u32::try_from(row.attempts).map_err(|e| DbError::decode("attempts", e))?,
            max_attempts: u32::try_from(row.max_attempts)
                .map_err(|e| DbError::decode("max_attempts", e))?,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}
