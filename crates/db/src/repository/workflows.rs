//! Workflow persistence.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use engine::models::WorkflowRecord;
use engine::store::WorkflowStore;
use engine::EngineError;

use crate::{DbError, DbPool, models::WorkflowRow};

const WORKFLOW_COLUMNS: &str = "id, name, definition, is_active, timeout_secs, created_at";

/// Insert a new workflow into the database.
///
/// `definition` is stored as given; it is validated when a run is admitted,
/// not here.
pub async fn create_workflow(
    pool: &PgPool,
    name: &str,
    definition: serde_json::Value,
    timeout_secs: Option<i64>,
) -> Result<WorkflowRow, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    let sql = format!(
        "INSERT INTO workflows (id, name, definition, is_active, timeout_secs, created_at) \
         VALUES ($1, $2, $3, TRUE, $4, $5) \
         RETURNING {WORKFLOW_COLUMNS}"
    );
    let row = sqlx::query_as::<_, WorkflowRow>(&sql)
        .bind(id)
        .bind(name)
        .bind(definition)
        .bind(timeout_secs)
        .bind(now)
        .fetch_one(pool)
        .await?;

    debug!(%id, name, "workflow created");
    Ok(row)
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<WorkflowRow, DbError> {
    let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1");
    let row = sqlx::query_as::<_, WorkflowRow>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Return all workflows ordered by creation time (newest first).
pub async fn list_workflows(pool: &PgPool) -> Result<Vec<WorkflowRow>, DbError> {
    let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at DESC");
    let rows = sqlx::query_as::<_, WorkflowRow>(&sql).fetch_all(pool).await?;
    Ok(rows)
}

/// [`WorkflowStore`] over the `workflows` table.
#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: DbPool,
}

impl PgWorkflowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn find(&self, id: Uuid) -> Result<Option<WorkflowRecord>, EngineError> {
        match get_workflow(&self.pool, id).await {
            Ok(row) => Ok(Some(row.try_into()?)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
