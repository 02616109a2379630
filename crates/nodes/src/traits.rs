//! The `NodeExecutor` contract and the values handed to it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::NodeError;

/// Flat key-value state threaded through a workflow run.
pub type Context = Map<String, Value>;

/// The entity a run acts on behalf of (typically a lead / contact).
///
/// Built from `context.lead` when the payload carries one; otherwise a
/// placeholder subject scoped to `context.project_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSubject {
    #[serde(default = "default_subject_id")]
    pub id: Value,
    #[serde(default = "default_subject_name")]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub project_id: Option<Value>,
}

fn default_subject_id() -> Value {
    Value::from(1)
}

fn default_subject_name() -> String {
    "Workflow Lead".to_string()
}

impl Default for ExecutionSubject {
    fn default() -> Self {
        Self {
            id: default_subject_id(),
            name: default_subject_name(),
            email: String::new(),
            project_id: None,
        }
    }
}

impl ExecutionSubject {
    pub fn from_context(ctx: &Context) -> Self {
        match ctx.get("lead") {
            Some(lead @ Value::Object(_)) => {
                serde_json::from_value(lead.clone()).unwrap_or_default()
            }
            _ => Self {
                project_id: ctx.get("project_id").filter(|v| !v.is_null()).cloned(),
                ..Self::default()
            },
        }
    }
}

/// A concrete action a workflow node can perform.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run the action described by the node's `config` (its `data` map)
    /// against `subject`, and return the keys to merge into the context.
    async fn execute(
        &self,
        config: &Map<String, Value>,
        subject: &ExecutionSubject,
        ctx: &Context,
    ) -> Result<Map<String, Value>, NodeError>;
}

/// Resolves an action key (`send_email`, `custom_webhook`, …) to an executor.
pub trait NodeExecutorFactory: Send + Sync {
    /// # Errors
    /// [`NodeError::NotFound`] if nothing is registered under `action_type`.
    fn create(&self, action_type: &str) -> Result<Arc<dyn NodeExecutor>, NodeError>;
}
