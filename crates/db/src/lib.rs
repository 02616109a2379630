//! `db` crate — Postgres persistence.
//!
//! Provides a connection pool, typed row structs, and repository functions
//! for every table in the flowgate schema, plus the store types that plug
//! them into the engine (`PgWorkflowStore`, `PgExecutionStore`) and the
//! queue (`PgJobQueue`).

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;

pub use pool::DbPool;
pub use error::DbError;
pub use repository::executions::PgExecutionStore;
pub use repository::jobs::PgJobQueue;
pub use repository::workflows::PgWorkflowStore;
