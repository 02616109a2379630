//! Built-in executors that need no external service.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{Context, ExecutionSubject, NodeError, NodeExecutor};

/// Returns the node's configured `output` object verbatim.
///
/// Lets a workflow be dry-run end to end: every effectful node reports what
/// it *would* have produced without touching the outside world.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticOutputExecutor;

#[async_trait]
impl NodeExecutor for StaticOutputExecutor {
    async fn execute(
        &self,
        config: &Map<String, Value>,
        _subject: &ExecutionSubject,
        _ctx: &Context,
    ) -> Result<Map<String, Value>, NodeError> {
        match config.get("output") {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(out)) => {
                debug!(keys = out.len(), "static executor returning configured output");
                Ok(out.clone())
            }
            Some(other) => Err(NodeError::Fatal(format!(
                "'output' must be an object, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn returns_configured_output() {
        let out = StaticOutputExecutor
            .execute(&config(json!({ "output": { "done": true } })), &Default::default(), &Map::new())
            .await
            .unwrap();
        assert_eq!(Value::Object(out), json!({ "done": true }));
    }

    #[tokio::test]
    async fn missing_output_is_empty() {
        let out = StaticOutputExecutor
            .execute(&Map::new(), &Default::default(), &Map::new())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn non_object_output_is_fatal() {
        let err = StaticOutputExecutor
            .execute(&config(json!({ "output": 3 })), &Default::default(), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Fatal(_)));
    }
}
