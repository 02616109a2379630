//! `queue` crate — asynchronous execution of admitted runs.
//!
//! [`Governor::submit`](engine::Governor::submit) enqueues a
//! [`JobDescriptor`](engine::store::JobDescriptor) through an
//! [`AsyncDispatcher`](engine::store::AsyncDispatcher); a [`Worker`] drains a
//! [`JobSource`] and runs each job through the governor again.

pub mod error;
pub mod job;
pub mod memory;
pub mod worker;

pub use error::QueueError;
pub use job::{JobSource, JobStatus, QueuedJob};
pub use memory::MemoryQueue;
pub use worker::{JobOutcome, Worker};
