//! `nodes` crate — the node executor capability and built-in executors.
//!
//! Concrete node work (sending email, calling webhooks, generating text, …)
//! lives behind [`NodeExecutor`]. The engine looks executors up by action key
//! through a [`NodeExecutorFactory`], normally a [`NodeRegistry`].

pub mod error;
pub mod traits;
pub mod registry;
pub mod builtin;
pub mod mock;

pub use error::NodeError;
pub use traits::{Context, ExecutionSubject, NodeExecutor, NodeExecutorFactory};
pub use registry::NodeRegistry;
pub use builtin::StaticOutputExecutor;
