//! Core domain models for the workflow engine.
//!
//! A workflow's graph is stored as raw JSON (the `definition` column of the
//! `workflows` table) and parsed into a [`WorkflowDefinition`] snapshot for
//! each run. Node types stay strings on the wire so that validation can
//! report unknown types instead of failing to deserialize.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use nodes::Context;

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// Every node type the engine knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Start,
    Action,
    Condition,
    Delay,
    Webhook,
    AiGenerate,
    SocialPublish,
    EmailSend,
    DataTransform,
}

impl NodeKind {
    pub const ALL: [NodeKind; 10] = [
        Self::Trigger,
        Self::Start,
        Self::Action,
        Self::Condition,
        Self::Delay,
        Self::Webhook,
        Self::AiGenerate,
        Self::SocialPublish,
        Self::EmailSend,
        Self::DataTransform,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Start => "start",
            Self::Action => "action",
            Self::Condition => "condition",
            Self::Delay => "delay",
            Self::Webhook => "webhook",
            Self::AiGenerate => "ai_generate",
            Self::SocialPublish => "social_publish",
            Self::EmailSend => "email_send",
            Self::DataTransform => "data_transform",
        }
    }

    /// Trigger and start nodes seed traversal.
    pub fn is_entry(&self) -> bool {
        matches!(self, Self::Trigger | Self::Start)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown node type: {s}"))
    }
}

// ---------------------------------------------------------------------------
// NodeDefinition / Edge / WorkflowDefinition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within this workflow (referenced by edges).
    pub id: String,
    /// Wire name of the node type; see [`NodeKind`].
    #[serde(rename = "type")]
    pub node_type: String,
    /// Node configuration handed to its executor.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, kind: NodeKind, data: Value) -> Self {
        Self {
            id: id.into(),
            node_type: kind.as_str().to_string(),
            data: match data {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    pub fn kind(&self) -> Option<NodeKind> {
        self.node_type.parse().ok()
    }

    /// Trigger/start nodes, or any node flagged with `data.isStart == true`.
    pub fn is_start(&self) -> bool {
        self.kind().is_some_and(|k| k.is_entry())
            || self.data.get("isStart").and_then(Value::as_bool) == Some(true)
    }
}

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Immutable graph snapshot used for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<Edge>,
    /// Payload keys that must be present for a run to be admitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
}

impl WorkflowDefinition {
    pub fn new(nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Self {
        Self {
            nodes,
            edges,
            required_fields: Vec::new(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Best-effort structural parse of a stored definition.
    ///
    /// Always returns whatever could be salvaged together with every
    /// structural problem found, so callers can keep accumulating errors.
    pub fn parse_lenient(value: &Value) -> (Self, Vec<String>) {
        let mut errors = Vec::new();
        let mut definition = Self::default();

        let Some(obj) = value.as_object() else {
            errors.push("Workflow definition must be an object".to_string());
            return (definition, errors);
        };

        match obj.get("nodes") {
            Some(Value::Array(raw_nodes)) => {
                for (index, raw) in raw_nodes.iter().enumerate() {
                    match parse_node(index, raw) {
                        Ok(node) => definition.nodes.push(node),
                        Err(message) => errors.push(message),
                    }
                }
            }
            _ => errors.push("Workflow definition must contain a 'nodes' array".to_string()),
        }

        match obj.get("edges") {
            Some(Value::Array(raw_edges)) => {
                for (index, raw) in raw_edges.iter().enumerate() {
                    match serde_json::from_value::<Edge>(raw.clone()) {
                        Ok(edge) => definition.edges.push(edge),
                        Err(_) => errors.push(format!(
                            "Edge at index {index} must have string 'source' and 'target'"
                        )),
                    }
                }
            }
            _ => errors.push("Workflow definition must contain an 'edges' array".to_string()),
        }

        match obj.get("required_fields") {
            None | Some(Value::Null) => {}
            Some(Value::Array(fields)) => {
                for field in fields {
                    match field.as_str() {
                        Some(name) => definition.required_fields.push(name.to_string()),
                        None => errors.push(format!("Required field entry {field} must be a string")),
                    }
                }
            }
            Some(_) => errors.push("'required_fields' must be an array of strings".to_string()),
        }

        (definition, errors)
    }

    /// Strict variant of [`WorkflowDefinition::parse_lenient`].
    pub fn from_value(value: &Value) -> Result<Self, Vec<String>> {
        let (definition, errors) = Self::parse_lenient(value);
        if errors.is_empty() {
            Ok(definition)
        } else {
            Err(errors)
        }
    }
}

fn parse_node(index: usize, raw: &Value) -> Result<NodeDefinition, String> {
    let Some(obj) = raw.as_object() else {
        return Err(format!("Node at index {index} must be an object"));
    };

    let id = obj.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    let node_type = obj.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
    let data = match obj.get("data") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(format!("Node at index {index} has a non-object 'data' field")),
    };

    Ok(NodeDefinition { id, node_type, data })
}

// ---------------------------------------------------------------------------
// WorkflowRecord
// ---------------------------------------------------------------------------

/// A persisted workflow as returned by the workflow store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub name: String,
    /// Raw graph JSON; parsed per run.
    pub definition: Value,
    pub is_active: bool,
    /// Configured run timeout, used when the caller passes none.
    pub timeout_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Convenience constructor for testing and in-process runs.
    pub fn new(name: impl Into<String>, definition: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            definition,
            is_active: true,
            timeout_secs: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

/// Caller-supplied knobs for one run.
///
/// Numeric fields are signed on purpose: the validator rejects non-positive
/// values with a message rather than failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Requested run timeout in seconds.
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub retry_count: Option<i64>,
    /// Per-node retry budget for retryable executor failures.
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
}

impl RunOptions {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    /// Completed, Failed and Cancelled rows never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created"   => Ok(Self::Created),
            "running"   => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "paused"    => Ok(Self::Paused),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Outcome of one successfully executed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Keys this node merged into the context.
    pub output: Map<String, Value>,
    pub message: String,
}

/// One run of a workflow, as persisted by the execution store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Option<i64>,
    pub status: ExecutionStatus,
    pub payload: Context,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub processed_nodes: Vec<String>,
    pub results: BTreeMap<String, NodeResult>,
    pub errors: BTreeMap<String, String>,
    /// Run-level failure (system errors), as opposed to per-node errors.
    pub error: Option<String>,
}

impl Execution {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.error.is_some()
    }
}

/// Fields needed to open a new execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: Uuid,
    pub user_id: Option<i64>,
    pub status: ExecutionStatus,
    pub payload: Context,
}

/// Partial update of an execution row; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub processed_nodes: Option<Vec<String>>,
    pub results: Option<BTreeMap<String, NodeResult>>,
    pub errors: Option<BTreeMap<String, String>>,
    pub error: Option<String>,
}

impl ExecutionUpdate {
    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Apply this update to an in-memory execution.
    pub fn apply_to(self, execution: &mut Execution) {
        if let Some(status) = self.status {
            execution.status = status;
        }
        if let Some(at) = self.completed_at {
            execution.completed_at = Some(at);
        }
        if let Some(ms) = self.execution_time_ms {
            execution.execution_time_ms = Some(ms);
        }
        if let Some(nodes) = self.processed_nodes {
            execution.processed_nodes = nodes;
        }
        if let Some(results) = self.results {
            execution.results = results;
        }
        if let Some(errors) = self.errors {
            execution.errors = errors;
        }
        if let Some(error) = self.error {
            execution.error = Some(error);
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// What a caller gets back from a synchronous run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// ID of the `workflow_executions` row created for this run.
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// True only when every reached node succeeded and the run was not cancelled.
    pub success: bool,
    pub results: BTreeMap<String, NodeResult>,
    pub errors: BTreeMap<String, String>,
    /// Successfully executed node ids, in execution order.
    pub processed_nodes: Vec<String>,
    /// Final merged context.
    pub context: Context,
    pub execution_time_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_kind_round_trips_wire_names() {
        for kind in NodeKind::ALL {
            assert_eq!(kind.as_str().parse::<NodeKind>(), Ok(kind));
        }
        assert!("sms_send".parse::<NodeKind>().is_err());
    }

    #[test]
    fn is_start_honours_flag_and_kind() {
        assert!(NodeDefinition::new("t", NodeKind::Trigger, json!({})).is_start());
        assert!(NodeDefinition::new("s", NodeKind::Start, json!({})).is_start());
        assert!(NodeDefinition::new("a", NodeKind::Action, json!({ "isStart": true })).is_start());
        assert!(!NodeDefinition::new("a", NodeKind::Action, json!({ "isStart": "yes" })).is_start());
    }

    #[test]
    fn lenient_parse_collects_structural_errors() {
        let (def, errors) = WorkflowDefinition::parse_lenient(&json!({
            "nodes": [ { "id": "t", "type": "trigger" }, 5 ],
            "edges": [ { "from": "t", "to": "a" }, { "source": 1 } ]
        }));

        assert_eq!(def.nodes.len(), 1);
        assert_eq!(def.edges, vec![Edge::new("t", "a")]);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("index 1"));
    }

    #[test]
    fn missing_collections_are_reported() {
        let errors = WorkflowDefinition::from_value(&json!({})).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("'nodes' array")));
        assert!(errors.iter().any(|e| e.contains("'edges' array")));
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
        assert_eq!("failed".parse::<ExecutionStatus>(), Ok(ExecutionStatus::Failed));
    }
}
