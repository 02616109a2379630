//! Traversal tests for the orchestrator.
//!
//! Runs use in-memory stores and `MockExecutor`s, so no database or real
//! node implementation is needed. Tickets are built directly, skipping the
//! governance layer (covered by the integration tests).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use nodes::mock::MockExecutor;
use nodes::{NodeExecutor, NodeRegistry};

use crate::circuit::{CircuitBreaker, CircuitThresholds};
use crate::clock::SystemClock;
use crate::config::ExecutionConfig;
use crate::governance::RunTicket;
use crate::memory::{MemoryCache, MemoryExecutionStore};
use crate::models::{Context, ExecutionStatus, RunOptions, WorkflowDefinition, WorkflowRecord};
use crate::orchestrator::Orchestrator;
use crate::store::{ExecutionStore, HistoryWindow, KeyedCache};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: Arc<Orchestrator>,
    store: Arc<MemoryExecutionStore>,
    breaker: Arc<CircuitBreaker>,
}

fn harness_with_cache(registry: NodeRegistry, cache: Arc<dyn KeyedCache>) -> Harness {
    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryExecutionStore::with_clock(clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(cache, clock.clone(), Duration::from_secs(3600)));
    let config = ExecutionConfig {
        retry_base_delay_ms: 1,
        ..ExecutionConfig::default()
    };

    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(registry),
        breaker.clone(),
        CircuitThresholds::default(),
        config,
        clock,
    );

    Harness {
        orchestrator: Arc::new(orchestrator),
        store,
        breaker,
    }
}

fn harness(registry: NodeRegistry) -> Harness {
    harness_with_cache(registry, Arc::new(MemoryCache::new()))
}

fn object(value: Value) -> Context {
    value.as_object().cloned().unwrap_or_default()
}

fn ticket(definition: Value, payload: Value, options: RunOptions) -> RunTicket {
    let parsed = WorkflowDefinition::from_value(&definition).expect("definition parses");
    RunTicket {
        workflow: WorkflowRecord::new("test-workflow", definition),
        definition: parsed,
        payload: object(payload),
        options,
    }
}

fn action(id: &str, action_type: &str) -> Value {
    json!({ "id": id, "type": "action", "data": { "action_type": action_type } })
}

fn trigger(id: &str) -> Value {
    json!({ "id": id, "type": "trigger", "data": {} })
}

fn edge(source: &str, target: &str) -> Value {
    json!({ "source": source, "target": target })
}

fn mock(name: &str, value: Value) -> Arc<MockExecutor> {
    Arc::new(MockExecutor::returning(name, value))
}

fn as_executor(mock: &Arc<MockExecutor>) -> Arc<dyn NodeExecutor> {
    mock.clone()
}

/// A cache whose every operation fails.
struct UnreachableCache;

#[async_trait]
impl KeyedCache for UnreachableCache {
    async fn get(&self, _key: &str) -> Result<Option<Value>, EngineError> {
        Err(EngineError::Store("cache unreachable".into()))
    }

    async fn put(&self, _key: &str, _value: Value, _ttl: Duration) -> Result<(), EngineError> {
        Err(EngineError::Store("cache unreachable".into()))
    }

    async fn forget(&self, _key: &str) -> Result<(), EngineError> {
        Err(EngineError::Store("cache unreachable".into()))
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&Value>,
        _new: Value,
        _ttl: Duration,
    ) -> Result<bool, EngineError> {
        Err(EngineError::Store("cache unreachable".into()))
    }
}

// ============================================================
// Traversal
// ============================================================

#[tokio::test]
async fn end_to_end_trigger_then_action() {
    let done = mock("done", json!({ "done": true }));
    let h = harness(NodeRegistry::new().with("finish", as_executor(&done)));

    let definition = json!({
        "nodes": [
            { "id": "T", "type": "trigger", "data": { "isStart": true } },
            action("A", "finish"),
        ],
        "edges": [edge("T", "A")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({}), RunOptions::default()))
        .await
        .expect("run completes");

    assert!(result.success);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.processed_nodes, vec!["T", "A"]);
    assert_eq!(Value::Object(result.context), json!({ "done": true }));
    assert!(result.errors.is_empty());

    let stored = h.store.find(result.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Completed);
    assert!(stored.completed_at.is_some());
    assert_eq!(stored.processed_nodes, vec!["T", "A"]);
}

#[tokio::test]
async fn failing_branch_is_contained() {
    let a = mock("a", json!({ "a": 1 }));
    let c = mock("c", json!({ "c": 1 }));
    let b: Arc<dyn NodeExecutor> = Arc::new(MockExecutor::failing_fatal("b", "smtp rejected"));
    let h = harness(
        NodeRegistry::new()
            .with("a", as_executor(&a))
            .with("b", b)
            .with("c", as_executor(&c)),
    );

    let definition = json!({
        "nodes": [trigger("Trigger"), action("A", "a"), action("B", "b"), action("C", "c")],
        "edges": [edge("Trigger", "A"), edge("Trigger", "B"), edge("B", "C")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({}), RunOptions::default()))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.processed_nodes, vec!["Trigger", "A"]);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors["B"], "smtp rejected");
    assert!(!result.results.contains_key("C"));
    assert!(!result.errors.contains_key("C"));
    assert_eq!(c.call_count(), 0);

    let stored = h.store.find(result.execution_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Failed);
    assert_eq!(stored.errors["B"], "smtp rejected");
}

#[tokio::test]
async fn later_outputs_overwrite_earlier_keys() {
    let a = mock("a", json!({ "x": 1, "from_a": true }));
    let b = mock("b", json!({ "x": 2 }));
    let h = harness(
        NodeRegistry::new()
            .with("a", as_executor(&a))
            .with("b", as_executor(&b)),
    );

    let definition = json!({
        "nodes": [trigger("Trigger"), action("A", "a"), action("B", "b")],
        "edges": [edge("Trigger", "A"), edge("A", "B")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({ "x": 0, "seed": "payload" }), RunOptions::default()))
        .await
        .unwrap();

    assert_eq!(result.context["x"], json!(2));
    assert_eq!(result.context["from_a"], json!(true));
    assert_eq!(result.context["seed"], json!("payload"));
    assert_eq!(b.last_context().unwrap()["x"], json!(1));
}

#[tokio::test]
async fn diamond_targets_run_once() {
    let join = mock("join", json!({}));
    let h = harness(
        NodeRegistry::new()
            .with("join", as_executor(&join))
            .with_fallback(Arc::new(MockExecutor::returning("noop", json!({})))),
    );

    let definition = json!({
        "nodes": [
            trigger("T"), action("L", "left"), action("R", "right"), action("J", "join"),
        ],
        "edges": [edge("T", "L"), edge("T", "R"), edge("L", "J"), edge("R", "J")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({}), RunOptions::default()))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.processed_nodes, vec!["T", "L", "R", "J"]);
    assert_eq!(join.call_count(), 1);
}

#[tokio::test]
async fn unregistered_action_is_a_noop_but_other_kinds_fail() {
    let h = harness(NodeRegistry::new());

    let definition = json!({
        "nodes": [
            trigger("T"),
            action("A", "crm_sync"),
            { "id": "W", "type": "webhook", "data": { "url": "https://example.test/hook" } },
        ],
        "edges": [edge("T", "A"), edge("T", "W")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({}), RunOptions::default()))
        .await
        .unwrap();

    assert_eq!(result.processed_nodes, vec!["T", "A"]);
    assert!(result.results["A"].output.is_empty());
    assert!(result.errors["W"].contains("custom_webhook"));
}

#[tokio::test]
async fn executor_kinds_resolve_their_action_keys() {
    let email = mock("email", json!({ "email_sent": true }));
    let facebook = mock("facebook", json!({ "posted": "now" }));
    let scheduled = mock("scheduled", json!({ "posted": "later" }));
    let h = harness(
        NodeRegistry::new()
            .with("send_email", as_executor(&email))
            .with("publish_social_post_immediately", as_executor(&facebook))
            .with("schedule_social_post", as_executor(&scheduled)),
    );

    let definition = json!({
        "nodes": [
            trigger("T"),
            { "id": "E", "type": "email_send", "data": { "to": "ops@example.test" } },
            { "id": "F", "type": "social_publish", "data": { "platform": "facebook" } },
            { "id": "L", "type": "social_publish", "data": { "platform": "linkedin" } },
        ],
        "edges": [edge("T", "E"), edge("T", "F"), edge("T", "L")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({}), RunOptions::default()))
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(email.call_count(), 1);
    assert_eq!(facebook.call_count(), 1);
    assert_eq!(scheduled.call_count(), 1);
    assert_eq!(result.context["posted"], json!("later"));
}

#[tokio::test]
async fn condition_records_its_outcome_without_gating() {
    let after = mock("after", json!({}));
    let h = harness(NodeRegistry::new().with("after", as_executor(&after)));

    let definition = json!({
        "nodes": [
            trigger("T"),
            { "id": "C", "type": "condition",
              "data": { "field": "score", "operator": "greater_than", "value": 50 } },
            action("N", "after"),
        ],
        "edges": [edge("T", "C"), edge("C", "N")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({ "score": 10 }), RunOptions::default()))
        .await
        .unwrap();

    assert_eq!(result.results["C"].output["condition_result"], json!(false));
    assert_eq!(result.context["condition_result"], json!(false));
    assert_eq!(after.call_count(), 1);
}

// ============================================================
// Circuit breaker and retries
// ============================================================

#[tokio::test]
async fn open_circuit_fails_the_node_without_dispatch() {
    let email = mock("email", json!({}));
    let h = harness(NodeRegistry::new().with("send_email", as_executor(&email)));
    h.breaker.force_open("email_send").await.unwrap();

    let definition = json!({
        "nodes": [
            trigger("T"),
            { "id": "E", "type": "email_send", "data": { "to": "ops@example.test" } },
        ],
        "edges": [edge("T", "E")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({}), RunOptions::default()))
        .await
        .unwrap();

    assert_eq!(email.call_count(), 0);
    assert_eq!(
        result.errors["E"],
        "Circuit breaker is open for node type 'email_send'"
    );
}

#[tokio::test]
async fn node_failures_feed_the_node_type_circuit() {
    let broken: Arc<dyn NodeExecutor> = Arc::new(MockExecutor::failing_fatal("hook", "502 from upstream"));
    let h = harness(NodeRegistry::new().with("custom_webhook", broken));

    let definition = json!({
        "nodes": [
            trigger("T"),
            { "id": "W", "type": "webhook", "data": { "url": "https://example.test" } },
        ],
        "edges": [edge("T", "W")],
    });

    for _ in 0..5 {
        h.orchestrator
            .run(ticket(definition.clone(), json!({}), RunOptions::default()))
            .await
            .unwrap();
    }

    let stats = h.breaker.stats("webhook").await.unwrap();
    assert_eq!(stats.status, crate::circuit::CircuitStatus::Open);
    assert_eq!(stats.failure_count, 5);
}

#[tokio::test]
async fn retryable_failures_are_retried() {
    let flaky = Arc::new(MockExecutor::flaky("flaky", 2, json!({ "ok": true })));
    let h = harness(NodeRegistry::new().with("flaky", as_executor(&flaky)));

    let definition = json!({
        "nodes": [trigger("T"), action("A", "flaky")],
        "edges": [edge("T", "A")],
    });

    let result = h
        .orchestrator
        .run(ticket(definition, json!({}), RunOptions::default()))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(flaky.call_count(), 3);
}

#[tokio::test]
async fn retry_budget_comes_from_run_options() {
    let down = Arc::new(MockExecutor::failing_retryable("down", "connection reset"));
    let h = harness(NodeRegistry::new().with("down", as_executor(&down)));

    let definition = json!({
        "nodes": [trigger("T"), action("A", "down")],
        "edges": [edge("T", "A")],
    });
    let options = RunOptions {
        max_retries: Some(1),
        ..RunOptions::default()
    };

    let result = h
        .orchestrator
        .run(ticket(definition, json!({}), options))
        .await
        .unwrap();

    assert_eq!(down.call_count(), 2);
    assert_eq!(result.errors["A"], "connection reset");
}

#[tokio::test]
async fn oversized_retry_override_is_capped_by_config() {
    let down = Arc::new(MockExecutor::failing_retryable("down", "connection reset"));
    let h = harness(NodeRegistry::new().with("down", as_executor(&down)));

    let definition = json!({
        "nodes": [trigger("T"), action("A", "down")],
        "edges": [edge("T", "A")],
    });
    let options = RunOptions {
        max_retries: Some(i64::MAX),
        ..RunOptions::default()
    };

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        h.orchestrator.run(ticket(definition, json!({}), options)),
    )
    .await
    .expect("retries stop at the configured ceiling")
    .unwrap();

    let ceiling = ExecutionConfig::default().max_node_retries as usize;
    assert_eq!(down.call_count(), ceiling + 1);
    assert_eq!(result.status, ExecutionStatus::Failed);
}

// ============================================================
// Cancellation and system errors
// ============================================================

#[tokio::test]
async fn cancellation_interrupts_a_delay() {
    let after = mock("after", json!({}));
    let h = harness(NodeRegistry::new().with("after", as_executor(&after)));

    let definition = json!({
        "nodes": [
            trigger("T"),
            { "id": "D", "type": "delay", "data": { "delay": 30 } },
            action("N", "after"),
        ],
        "edges": [edge("T", "D"), edge("D", "N")],
    });
    let ticket = ticket(definition, json!({}), RunOptions::default());
    let workflow_id = ticket.workflow().id;

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.run(ticket).await });

    let execution_id = loop {
        let history = h
            .store
            .get_by_workflow_id(workflow_id, HistoryWindow::latest(1))
            .await
            .unwrap();
        if let Some(execution) = history.first() {
            if h.orchestrator.is_running(execution.id) {
                break execution.id;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    assert!(h.orchestrator.cancel_local(execution_id));
    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run stops promptly")
        .expect("task joins")
        .expect("run returns a result");

    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(!result.success);
    assert_eq!(result.processed_nodes, vec!["T"]);
    assert_eq!(after.call_count(), 0);
    assert!(!h.orchestrator.is_running(execution_id));

    let stored = h.store.find(execution_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExecutionStatus::Cancelled);

    let delay = h.breaker.stats("delay").await.unwrap();
    assert_eq!(delay.total_requests, 0, "interrupted delay is not counted");
    assert_eq!(delay.successful_requests, 0);
}

#[tokio::test]
async fn cancel_of_unknown_run_is_not_signalled() {
    let h = harness(NodeRegistry::new());
    assert!(!h.orchestrator.cancel_local(uuid::Uuid::new_v4()));
}

#[tokio::test]
async fn unreachable_circuit_state_is_a_system_error() {
    let h = harness_with_cache(NodeRegistry::new(), Arc::new(UnreachableCache));

    let definition = json!({ "nodes": [trigger("T")], "edges": [] });
    let ticket = ticket(definition, json!({}), RunOptions::default());
    let workflow_id = ticket.workflow().id;

    let err = h.orchestrator.run(ticket).await.unwrap_err();
    assert!(matches!(err, EngineError::System(ref msg) if msg.contains("cache unreachable")));

    let stored = h
        .store
        .get_by_workflow_id(workflow_id, HistoryWindow::default())
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ExecutionStatus::Failed);
    assert!(stored[0].error.as_deref().unwrap_or_default().contains("cache unreachable"));
    assert!(stored[0].execution_time_ms.is_some());
}
