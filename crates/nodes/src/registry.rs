//! Map-backed [`NodeExecutorFactory`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::{NodeError, NodeExecutor, NodeExecutorFactory};

/// Maps action keys to shared executor instances.
///
/// An optional fallback answers every key that has no explicit entry; the
/// CLI uses that to dry-run workflows with [`crate::StaticOutputExecutor`].
#[derive(Default, Clone)]
pub struct NodeRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
    fallback: Option<Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the executor for `action_type`.
    pub fn register(&mut self, action_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(action_type.into(), executor);
    }

    /// Builder-style [`NodeRegistry::register`].
    pub fn with(mut self, action_type: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        self.register(action_type, executor);
        self
    }

    pub fn with_fallback(mut self, executor: Arc<dyn NodeExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn action_types(&self) -> impl Iterator<Item = &str> {
        self.executors.keys().map(String::as_str)
    }
}

impl NodeExecutorFactory for NodeRegistry {
    fn create(&self, action_type: &str) -> Result<Arc<dyn NodeExecutor>, NodeError> {
        self.executors
            .get(action_type)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| NodeError::NotFound(action_type.to_string()))
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.executors.keys().collect();
        keys.sort();
        f.debug_struct("NodeRegistry")
            .field("executors", &keys)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockExecutor;
    use crate::StaticOutputExecutor;
    use serde_json::json;

    #[test]
    fn unknown_key_is_not_found() {
        let registry = NodeRegistry::new();
        assert_eq!(
            registry.create("send_email").err(),
            Some(NodeError::NotFound("send_email".into()))
        );
    }

    #[tokio::test]
    async fn registered_key_resolves() {
        let registry = NodeRegistry::new()
            .with("send_email", Arc::new(MockExecutor::returning("email", json!({ "sent": true }))));

        let executor = registry.create("send_email").expect("registered");
        let out = executor
            .execute(&Default::default(), &Default::default(), &Default::default())
            .await
            .expect("mock succeeds");
        assert_eq!(out["sent"], json!(true));
    }

    #[test]
    fn fallback_answers_unregistered_keys() {
        let registry = NodeRegistry::new().with_fallback(Arc::new(StaticOutputExecutor));
        assert!(registry.create("anything").is_ok());
    }
}
