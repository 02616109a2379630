//! Job queue persistence.
//!
//! The queue is backed by the `job_queue` Postgres table. Workers poll the
//! table and use `SELECT … FOR UPDATE SKIP LOCKED` for safe concurrent
//! processing.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use engine::store::{AsyncDispatcher, JobDescriptor, JobId};
use engine::EngineError;
use queue::{JobSource, JobStatus, QueueError, QueuedJob};

use crate::{
    DbError, DbPool,
    models::{JobRow, JOB_COLUMNS},
};

/// Enqueue a new job.
///
/// `descriptor` is stored as the job payload and handed back to the worker.
pub async fn enqueue_job(
    pool: &PgPool,
    descriptor: &JobDescriptor,
    max_attempts: i32,
) -> Result<JobRow, DbError> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    let payload = serde_json::to_value(descriptor).map_err(|e| DbError::decode("payload", e))?;

    let sql = format!(
        "INSERT INTO job_queue \
             (id, workflow_id, status, attempts, max_attempts, payload, created_at, updated_at) \
         VALUES ($1, $2, 'pending', 0, $3, $4, $5, $5) \
         RETURNING {JOB_COLUMNS}"
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(id)
        .bind(descriptor.workflow_id)
        .bind(max_attempts)
        .bind(payload)
        .bind(now)
        .fetch_one(pool)
        .await?;

    Ok(row)
}

/// Atomically fetch the oldest pending job and mark it as `processing`.
///
/// Uses `SELECT … FOR UPDATE SKIP LOCKED` so multiple workers can poll
/// safely without stepping on each other.
///
/// Returns `None` if no pending jobs exist.
pub async fn fetch_next_job(pool: &PgPool) -> Result<Option<JobRow>, DbError> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM job_queue \
         WHERE status = 'pending' \
         ORDER BY created_at ASC \
         LIMIT 1 \
         FOR UPDATE SKIP LOCKED"
    );
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(job) = row else {
        tx.rollback().await?;
        return Ok(None);
    };

    let sql = format!(
        "UPDATE job_queue \
         SET status = 'processing', attempts = attempts + 1, updated_at = $1 \
         WHERE id = $2 \
         RETURNING {JOB_COLUMNS}"
    );
    let claimed = sqlx::query_as::<_, JobRow>(&sql)
        .bind(Utc::now())
        .bind(job.id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(Some(claimed))
}

/// Mark a `processing` job as completed.
///
/// Returns `false` if the job is not currently processing.
pub async fn complete_job(pool: &PgPool, job_id: Uuid) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE job_queue SET status = 'completed', updated_at = $1 \
         WHERE id = $2 AND status = 'processing'",
    )
    .bind(Utc::now())
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Record a failed delivery of a `processing` job.
///
/// With `retry` the job returns to `pending` while attempts remain; otherwise
/// it is dead-lettered. Returns the new status, or `None` if the job is not
/// currently processing.
pub async fn fail_job(
    pool: &PgPool,
    job_id: Uuid,
    error: &str,
    retry: bool,
) -> Result<Option<String>, DbError> {
    let status = sqlx::query_scalar::<_, String>(
        "UPDATE job_queue \
         SET status = CASE WHEN $2 AND attempts < max_attempts THEN 'pending' ELSE 'dead_lettered' END, \
             last_error = $3, \
             updated_at = $4 \
         WHERE id = $1 AND status = 'processing' \
         RETURNING status",
    )
    .bind(job_id)
    .bind(retry)
    .bind(error)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    Ok(status)
}

pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<JobRow, DbError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = $1");
    let row = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Postgres-backed queue: the dispatcher side for the governor and the
/// [`JobSource`] side for workers.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: DbPool,
    max_attempts: i32,
}

impl PgJobQueue {
    pub fn new(pool: DbPool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: i32::try_from(max_attempts.max(1)).unwrap_or(i32::MAX),
        }
    }

    /// Explain why a job could not be settled.
    async fn not_processing(&self, id: JobId) -> QueueError {
        match get_job(&self.pool, id).await {
            Ok(row) => QueueError::NotProcessing { id, status: row.status },
            Err(DbError::NotFound) => QueueError::JobNotFound(id),
            Err(e) => e.into(),
        }
    }
}

#[async_trait]
impl AsyncDispatcher for PgJobQueue {
    async fn enqueue(&self, job: JobDescriptor) -> Result<JobId, EngineError> {
        let row = enqueue_job(&self.pool, &job, self.max_attempts).await?;
        debug!(id = %row.id, workflow_id = %row.workflow_id, "job enqueued");
        Ok(row.id)
    }
}

#[async_trait]
impl JobSource for PgJobQueue {
    async fn fetch_next(&self) -> Result<Option<QueuedJob>, QueueError> {
        let Some(row) = fetch_next_job(&self.pool).await? else {
            return Ok(None);
        };
        Ok(Some(row.try_into()?))
    }

    async fn complete(&self, id: JobId) -> Result<(), QueueError> {
        if complete_job(&self.pool, id).await? {
            Ok(())
        } else {
            Err(self.not_processing(id).await)
        }
    }

    async fn fail(&self, id: JobId, error: &str, retry: bool) -> Result<JobStatus, QueueError> {
        let Some(status) = fail_job(&self.pool, id, error, retry).await? else {
            return Err(self.not_processing(id).await);
        };

        let status: JobStatus = status.parse().map_err(QueueError::Backend)?;
        match status {
            JobStatus::Pending => info!(%id, "job requeued"),
            _ => warn!(%id, error, "job dead-lettered"),
        }
        Ok(status)
    }
}
