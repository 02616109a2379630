//! Graph validation — run this before admitting or executing a workflow.
//!
//! Checks are accumulated rather than short-circuited, so a caller sees every
//! problem with a definition at once:
//! 1. Structure: `nodes` and `edges` arrays, at least one node.
//! 2. Nodes: unique non-empty ids, known types, type-specific required fields.
//! 3. Edges: both endpoints exist, no self-loops.
//! 4. Connectivity: at least one start node; every node reachable from the
//!    union of start nodes.
//! 5. Payload: every `required_fields` entry present.
//! 6. Options: `user_id`/`timeout` positive, `retry_count`/`max_retries`
//!    non-negative.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use serde_json::Value;

use crate::models::{Context, NodeDefinition, NodeKind, RunOptions, WorkflowDefinition};

/// Result of [`validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Validate a stored definition together with the run's payload and options.
pub fn validate(definition: &Value, payload: &Context, options: &RunOptions) -> ValidationReport {
    let (parsed, mut errors) = WorkflowDefinition::parse_lenient(definition);

    errors.extend(validate_graph(&parsed));
    errors.extend(validate_payload(&parsed, payload));
    errors.extend(validate_options(options));

    ValidationReport::from_errors(errors)
}

/// Node, edge and connectivity checks on an already-parsed definition.
pub fn validate_graph(definition: &WorkflowDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    if definition.nodes.is_empty() {
        errors.push("Workflow must have at least one node".to_string());
        return errors;
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for (index, node) in definition.nodes.iter().enumerate() {
        if node.id.trim().is_empty() {
            errors.push(format!("Node at index {index} must have a non-empty id"));
        } else if !seen_ids.insert(node.id.as_str()) {
            errors.push(format!("Duplicate node id '{}'", node.id));
        }

        match node.kind() {
            Some(kind) => errors.extend(required_fields(node, kind)),
            None => errors.push(format!(
                "Node '{}' has invalid type '{}'",
                node.id, node.node_type
            )),
        }
    }

    // -----------------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------------
    let node_set: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();

    for (index, edge) in definition.edges.iter().enumerate() {
        if !node_set.contains(edge.source.as_str()) {
            errors.push(format!(
                "Edge {index} references unknown source node '{}'",
                edge.source
            ));
        }
        if !node_set.contains(edge.target.as_str()) {
            errors.push(format!(
                "Edge {index} references unknown target node '{}'",
                edge.target
            ));
        }
        if edge.source == edge.target {
            errors.push(format!("Edge {index} is a self-loop on node '{}'", edge.source));
        }
    }

    // -----------------------------------------------------------------------
    // Connectivity
    // -----------------------------------------------------------------------
    if start_nodes(definition).next().is_none() {
        errors.push("Workflow must have at least one start node".to_string());
    }

    for id in unreachable_nodes(definition) {
        errors.push(format!("Node '{id}' is not reachable from any start node"));
    }

    errors
}

/// Start nodes, in definition order.
pub fn start_nodes(definition: &WorkflowDefinition) -> impl Iterator<Item = &NodeDefinition> {
    definition.nodes.iter().filter(|n| n.is_start())
}

/// Outgoing adjacency, keeping edge order. Edges to unknown nodes are kept;
/// callers resolve ids against the node list.
pub fn adjacency(definition: &WorkflowDefinition) -> HashMap<&str, Vec<&str>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &definition.edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }
    adjacency
}

/// Union of everything BFS-reachable from every start node.
pub fn reachable_nodes(definition: &WorkflowDefinition) -> HashSet<&str> {
    let adjacency = adjacency(definition);
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = start_nodes(definition).map(|n| n.id.as_str()).collect();

    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(next) = adjacency.get(id) {
            queue.extend(next.iter().copied().filter(|t| !reachable.contains(t)));
        }
    }

    reachable
}

/// Node ids (definition order, deduplicated) not reachable from any start node.
pub fn unreachable_nodes(definition: &WorkflowDefinition) -> Vec<String> {
    let reachable = reachable_nodes(definition);
    let mut reported: HashSet<&str> = HashSet::new();

    definition
        .nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !reachable.contains(id) && reported.insert(*id))
        .map(str::to_owned)
        .collect()
}

fn validate_payload(definition: &WorkflowDefinition, payload: &Context) -> Vec<String> {
    definition
        .required_fields
        .iter()
        .filter(|field| !payload.contains_key(field.as_str()))
        .map(|field| format!("Required field '{field}' is missing from payload"))
        .collect()
}

fn validate_options(options: &RunOptions) -> Vec<String> {
    let mut errors = Vec::new();

    if options.user_id.is_some_and(|v| v <= 0) {
        errors.push("user_id must be a positive integer".to_string());
    }
    if options.timeout.is_some_and(|v| v <= 0) {
        errors.push("timeout must be a positive integer".to_string());
    }
    if options.retry_count.is_some_and(|v| v < 0) {
        errors.push("retry_count must be a non-negative integer".to_string());
    }
    if options.max_retries.is_some_and(|v| v < 0) {
        errors.push("max_retries must be a non-negative integer".to_string());
    }

    errors
}

// ---------------------------------------------------------------------------
// Type-specific requirements
// ---------------------------------------------------------------------------

fn has_value(node: &NodeDefinition, key: &str) -> bool {
    match node.data.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

/// Numeric value of `data[key]`, accepting numeric strings.
pub(crate) fn numeric(node: &NodeDefinition, key: &str) -> Option<f64> {
    match node.data.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn required_fields(node: &NodeDefinition, kind: NodeKind) -> Vec<String> {
    let id = &node.id;
    let mut errors = Vec::new();

    match kind {
        NodeKind::Webhook if !has_value(node, "url") => {
            errors.push(format!("Webhook node '{id}' requires 'url'"));
        }
        NodeKind::Condition => {
            // `condition` is the legacy name of the field key.
            if !has_value(node, "field") && !has_value(node, "condition") {
                errors.push(format!("Condition node '{id}' requires 'field'"));
            }
            if !has_value(node, "operator") {
                errors.push(format!("Condition node '{id}' requires 'operator'"));
            }
        }
        NodeKind::Delay if !numeric(node, "delay").is_some_and(|d| d >= 0.0) => {
            errors.push(format!("Delay node '{id}' requires a non-negative numeric 'delay'"));
        }
        NodeKind::EmailSend if !has_value(node, "to") => {
            errors.push(format!("Email node '{id}' requires 'to'"));
        }
        NodeKind::AiGenerate if !has_value(node, "prompt") => {
            errors.push(format!("AI generate node '{id}' requires 'prompt'"));
        }
        NodeKind::SocialPublish if !has_value(node, "platform") => {
            errors.push(format!("Social publish node '{id}' requires 'platform'"));
        }
        _ => {}
    }

    errors
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Edge;
    use serde_json::json;

    fn node(id: &str, kind: NodeKind) -> NodeDefinition {
        NodeDefinition::new(id, kind, json!({}))
    }

    fn edge(from: &str, to: &str) -> Edge {
        Edge::new(from, to)
    }

    fn check(definition: &WorkflowDefinition) -> ValidationReport {
        validate(&definition.to_value(), &Context::new(), &RunOptions::default())
    }

    #[test]
    fn valid_linear_workflow() {
        // T → A → B
        let def = WorkflowDefinition::new(
            vec![node("t", NodeKind::Trigger), node("a", NodeKind::Action), node("b", NodeKind::Action)],
            vec![edge("t", "a"), edge("a", "b")],
        );
        let report = check(&def);
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
    }

    #[test]
    fn diamond_and_cycle_downstream_of_start_are_valid() {
        //   T
        //  / \
        // A   B
        //  \ / \
        //   C ← D, and C → B closes a cycle
        let def = WorkflowDefinition::new(
            vec![
                node("t", NodeKind::Trigger),
                node("a", NodeKind::Action),
                node("b", NodeKind::Action),
                node("c", NodeKind::Action),
                node("d", NodeKind::Action),
            ],
            vec![
                edge("t", "a"),
                edge("t", "b"),
                edge("a", "c"),
                edge("b", "d"),
                edge("d", "c"),
                edge("c", "b"),
            ],
        );
        assert!(check(&def).valid);
    }

    #[test]
    fn isolated_node_fails_validation() {
        let def = WorkflowDefinition::new(
            vec![node("t", NodeKind::Trigger), node("a", NodeKind::Action), node("lonely", NodeKind::Action)],
            vec![edge("t", "a")],
        );
        let report = check(&def);
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec!["Node 'lonely' is not reachable from any start node".to_string()]
        );
    }

    #[test]
    fn unreachable_set_is_exact_across_multiple_starts() {
        // s1 → a, s2 → b, x → y (x and y float free)
        let mut flagged = node("s2", NodeKind::Action);
        flagged.data.insert("isStart".into(), json!(true));

        let def = WorkflowDefinition::new(
            vec![
                node("s1", NodeKind::Start),
                node("a", NodeKind::Action),
                flagged,
                node("b", NodeKind::Action),
                node("x", NodeKind::Action),
                node("y", NodeKind::Action),
            ],
            vec![edge("s1", "a"), edge("s2", "b"), edge("x", "y")],
        );

        assert_eq!(unreachable_nodes(&def), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn missing_start_node_is_reported() {
        let def = WorkflowDefinition::new(
            vec![node("a", NodeKind::Action), node("b", NodeKind::Action)],
            vec![edge("a", "b")],
        );
        let report = check(&def);
        assert!(report.errors.contains(&"Workflow must have at least one start node".to_string()));
        assert_eq!(unreachable_nodes(&def), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn duplicate_and_empty_ids_are_rejected() {
        let def = WorkflowDefinition::new(
            vec![node("t", NodeKind::Trigger), node("t", NodeKind::Action), node("", NodeKind::Action)],
            vec![],
        );
        let errors = check(&def).errors;
        assert!(errors.contains(&"Duplicate node id 't'".to_string()));
        assert!(errors.contains(&"Node at index 2 must have a non-empty id".to_string()));
    }

    #[test]
    fn bad_edges_are_all_reported() {
        let def = WorkflowDefinition::new(
            vec![node("t", NodeKind::Trigger)],
            vec![edge("t", "ghost"), edge("t", "t")],
        );
        let errors = check(&def).errors;
        assert!(errors.contains(&"Edge 0 references unknown target node 'ghost'".to_string()));
        assert!(errors.contains(&"Edge 1 is a self-loop on node 't'".to_string()));
    }

    #[test]
    fn type_specific_fields_are_required() {
        let def = json!({
            "nodes": [
                { "id": "t", "type": "trigger" },
                { "id": "w", "type": "webhook", "data": {} },
                { "id": "c", "type": "condition", "data": { "field": "score" } },
                { "id": "d", "type": "delay", "data": { "delay": "soon" } },
                { "id": "e", "type": "email_send", "data": { "to": "" } },
                { "id": "g", "type": "ai_generate", "data": {} },
                { "id": "s", "type": "social_publish", "data": {} },
                { "id": "z", "type": "teleport" }
            ],
            "edges": [
                { "source": "t", "target": "w" }, { "source": "t", "target": "c" },
                { "source": "t", "target": "d" }, { "source": "t", "target": "e" },
                { "source": "t", "target": "g" }, { "source": "t", "target": "s" },
                { "source": "t", "target": "z" }
            ]
        });

        let errors = validate(&def, &Context::new(), &RunOptions::default()).errors;
        assert_eq!(
            errors,
            vec![
                "Webhook node 'w' requires 'url'",
                "Condition node 'c' requires 'operator'",
                "Delay node 'd' requires a non-negative numeric 'delay'",
                "Email node 'e' requires 'to'",
                "AI generate node 'g' requires 'prompt'",
                "Social publish node 's' requires 'platform'",
                "Node 'z' has invalid type 'teleport'",
            ]
        );
    }

    #[test]
    fn payload_and_options_are_checked() {
        let def = json!({
            "nodes": [ { "id": "t", "type": "trigger" } ],
            "edges": [],
            "required_fields": ["email", "name"]
        });
        let payload = json!({ "email": "a@b.c" }).as_object().cloned().unwrap();
        let options = RunOptions {
            user_id: Some(0),
            timeout: Some(-5),
            retry_count: Some(-1),
            ..RunOptions::default()
        };

        let report = validate(&def, &payload, &options);
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec![
                "Required field 'name' is missing from payload",
                "user_id must be a positive integer",
                "timeout must be a positive integer",
                "retry_count must be a non-negative integer",
            ]
        );
    }

    #[test]
    fn empty_definition_is_invalid() {
        let report = validate(&json!({ "nodes": [], "edges": [] }), &Context::new(), &RunOptions::default());
        assert_eq!(report.errors, vec!["Workflow must have at least one node".to_string()]);
    }
}
