//! Repository functions, one per database operation, and the store types
//! built on them.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Queries are checked at runtime, so building needs no live database.

pub mod workflows;
pub mod executions;
pub mod jobs;
