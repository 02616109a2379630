//! Queued job types and the contract workers pull from.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use engine::store::{JobDescriptor, JobId};

use crate::QueueError;

/// Possible statuses for a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending      => "pending",
            Self::Processing   => "processing",
            Self::Completed    => "completed",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"       => Ok(Self::Pending),
            "processing"    => Ok(Self::Processing),
            "completed"     => Ok(Self::Completed),
            "dead_lettered" => Ok(Self::DeadLettered),
            other           => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A job as held by a queue backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub descriptor: JobDescriptor,
    pub status: JobStatus,
    /// Deliveries so far, including the current one.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(descriptor: JobDescriptor, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// Where a worker gets its jobs from.
///
/// `fetch_next` hands out each pending job to exactly one caller and marks it
/// `Processing`.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_next(&self) -> Result<Option<QueuedJob>, QueueError>;

    async fn complete(&self, id: JobId) -> Result<(), QueueError>;

    /// Record a failed delivery. With `retry` the job goes back to `Pending`
    /// unless its attempts are used up; otherwise it is dead-lettered.
    /// Returns the job's new status.
    async fn fail(&self, id: JobId, error: &str, retry: bool) -> Result<JobStatus, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::DeadLettered,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("failed".parse::<JobStatus>().is_err());
    }
}
