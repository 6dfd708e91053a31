//! End-to-end runtime scenarios: trigger flows through the facade and
//! observe status, results, logs and cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use flowrunner::prelude::*;

async fn wait_terminal(runtime: &Runtime, account: &str, id: &str) -> ExecutionStatus {
    for _ in 0..400 {
        let status = runtime.status(account, id).await.unwrap();
        if status.state.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution '{id}' did not reach a terminal state");
}

fn stub_registry() -> Arc<NodeRegistry> {
    let registry = Arc::new(NodeRegistry::with_builtins());
    registry.register_behavior(
        "http.request",
        Arc::new(FunctionBehavior::new("http.request", |_item, _attempt| {
            Ok(json!({"status": 200}))
        })),
    );
    registry.register_behavior(
        "webhook",
        Arc::new(FunctionBehavior::new("webhook", |_item, _attempt| {
            Ok(json!({"ack": true}))
        })),
    );
    registry
}

#[tokio::test]
async fn linear_flow_succeeds_with_ordered_logs() {
    let runtime = Runtime::builder().registry(stub_registry()).build();
    runtime
        .register_flow(
            "acct",
            "linear",
            r#"
name: linear
nodes:
  start:
    type: http.request
    next:
      default: end
  end:
    type: webhook
"#,
        )
        .await
        .unwrap();

    let id = runtime
        .trigger("acct", "linear", json!({"topic": "x"}))
        .await
        .unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Succeeded);
    assert_eq!(status.results["start"], json!({"status": 200}));
    assert_eq!(status.results["end"], json!({"ack": true}));
    assert_eq!(status.current_node.as_deref(), Some("end"));
    assert!(status.ended_at.is_some());
    assert_eq!(status.progress, 1.0);

    let logs = runtime.logs("acct", &id).await.unwrap();
    let messages: Vec<&str> = logs.iter().map(|e| e.message.as_str()).collect();
    let position = |needle: &str| {
        messages
            .iter()
            .position(|m| *m == needle)
            .unwrap_or_else(|| panic!("missing log '{needle}'"))
    };
    assert!(position("entering node start") < position("node start complete"));
    assert!(position("node start complete") < position("entering node end"));
    assert!(position("entering node end") < position("node end complete"));

    // seq is strictly increasing.
    assert!(logs.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn expressions_resolve_secrets_and_shared_input() {
    let runtime = Runtime::builder().build();
    runtime.vault().set("acct", "API_KEY", "k-1").await.unwrap();
    runtime
        .register_flow(
            "acct",
            "call",
            r#"
name: call
nodes:
  call:
    type: echo
    params:
      headers:
        Authorization: "${'Bearer ' + secrets.API_KEY}"
      body:
        user: "${shared.user_id}"
"#,
        )
        .await
        .unwrap();

    let id = runtime
        .trigger("acct", "call", json!({"user_id": "u-7"}))
        .await
        .unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Succeeded);
    let resolved = &status.results["call"]["params"];
    assert_eq!(resolved["headers"]["Authorization"], json!("Bearer k-1"));
    assert_eq!(resolved["body"]["user"], json!("u-7"));
}

#[tokio::test]
async fn retry_then_succeed() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let registry = Arc::new(NodeRegistry::new());
    registry.register_behavior(
        "flaky",
        Arc::new(FunctionBehavior::new("flaky", move |_item, _attempt| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(NodeError::retryable("connection reset"))
            } else {
                Ok(json!(42))
            }
        })),
    );

    let runtime = Runtime::builder().registry(registry).build();
    runtime
        .register_flow(
            "acct",
            "retry",
            r#"
name: retry
nodes:
  flaky:
    type: flaky
    retry:
      max_attempts: 3
      wait_ms: 0
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "retry", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Succeeded);
    assert_eq!(status.results["flaky"], json!(42));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let logs = runtime.logs("acct", &id).await.unwrap();
    let retry_warnings = logs
        .iter()
        .filter(|e| e.level == LogLevel::Warn && e.message.contains("retrying"))
        .count();
    assert_eq!(retry_warnings, 2);
    assert!(logs.iter().any(|e| e.message == "node flaky complete"));
}

#[tokio::test]
async fn permanent_failure_routes_the_error_edge() {
    let registry = Arc::new(NodeRegistry::with_builtins());
    registry.register_behavior(
        "doomed",
        Arc::new(FunctionBehavior::new("doomed", |_item, _attempt| {
            Err(NodeError::permanent("upstream rejected the request"))
        })),
    );

    let runtime = Runtime::builder().registry(registry).build();
    runtime
        .register_flow(
            "acct",
            "branch",
            r#"
name: branch
nodes:
  call:
    type: doomed
    next:
      default: ok
      error: rescue
  ok:
    type: transform
    params:
      value: "unreachable"
  rescue:
    type: transform
    params:
      value: "${'rescued after: ' + results.call.error}"
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "branch", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Succeeded);
    let failure = status.results["call"]["error"].as_str().unwrap();
    assert!(failure.contains("upstream rejected"));
    assert!(!status.results.contains_key("ok"));
    assert!(
        status.results["rescue"]
            .as_str()
            .unwrap()
            .starts_with("rescued after:")
    );
}

#[tokio::test]
async fn failure_without_an_error_edge_fails_the_execution() {
    let registry = Arc::new(NodeRegistry::new());
    registry.register_behavior(
        "doomed",
        Arc::new(FunctionBehavior::new("doomed", |_item, _attempt| {
            Err(NodeError::permanent("boom"))
        })),
    );

    let runtime = Runtime::builder().registry(registry).build();
    runtime
        .register_flow("acct", "f", "name: f\nnodes:\n  only:\n    type: doomed\n")
        .await
        .unwrap();

    let id = runtime.trigger("acct", "f", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Failed);
    let error = status.error.as_deref().unwrap();
    assert!(error.contains("boom"));
    assert!(status.ended_at.is_some());
}

#[tokio::test]
async fn cancellation_mid_flow() {
    let runtime = Runtime::builder().build();
    runtime
        .register_flow(
            "acct",
            "slow",
            r#"
name: slow
nodes:
  first:
    type: transform
    params:
      value: "quick"
    next:
      default: second
  second:
    type: wait
    params:
      duration_ms: 10000
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "slow", Value::Null).await.unwrap();

    // Wait until the first node's result lands and the walk enters `second`.
    for _ in 0..400 {
        let status = runtime.status("acct", &id).await.unwrap();
        if status.current_node.as_deref() == Some("second") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    runtime.cancel("acct", &id).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Cancelled);
    assert_eq!(status.results["first"], json!("quick"));
    assert!(!status.results.contains_key("second"));
    assert!(status.ended_at.is_some());
    assert!(status.error.is_none());

    // Cancel is idempotent on a finished execution.
    runtime.cancel("acct", &id).await.unwrap();
}

#[tokio::test]
async fn per_attempt_deadline_exhausts_into_failure() {
    let runtime = Runtime::builder().build();
    runtime
        .register_flow(
            "acct",
            "deadline",
            r#"
name: deadline
nodes:
  stall:
    type: wait
    params:
      duration_ms: 5000
    timeout_ms: 20
    retry:
      max_attempts: 2
      wait_ms: 0
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "deadline", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Failed);
    assert!(status.error.as_deref().unwrap().contains("timed out"));

    let logs = runtime.logs("acct", &id).await.unwrap();
    assert_eq!(
        logs.iter()
            .filter(|e| e.level == LogLevel::Warn && e.message.contains("retrying"))
            .count(),
        1
    );
}

#[tokio::test]
async fn evaluation_error_fails_the_node_permanently() {
    let runtime = Runtime::builder().build();
    runtime
        .register_flow(
            "acct",
            "broken",
            r#"
name: broken
nodes:
  only:
    type: transform
    params:
      value: "${nonsense.field}"
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "broken", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Failed);
    assert!(status.error.as_deref().unwrap().contains("nonsense"));
}

#[tokio::test]
async fn retriggering_yields_independent_executions() {
    let runtime = Runtime::builder().build();
    runtime
        .register_flow(
            "acct",
            "greet",
            r#"
name: greet
nodes:
  greet:
    type: transform
    params:
      value: "${'hi ' + shared.who}"
"#,
        )
        .await
        .unwrap();

    let first = runtime
        .trigger("acct", "greet", json!({"who": "a"}))
        .await
        .unwrap();
    let second = runtime
        .trigger("acct", "greet", json!({"who": "b"}))
        .await
        .unwrap();
    assert_ne!(first, second);

    let first = wait_terminal(&runtime, "acct", &first).await;
    let second = wait_terminal(&runtime, "acct", &second).await;
    assert_eq!(first.results["greet"], json!("hi a"));
    assert_eq!(second.results["greet"], json!("hi b"));

    assert_eq!(runtime.list_executions("acct").await.unwrap().len(), 2);
}

#[tokio::test]
async fn single_node_flow_runs_exactly_once() {
    let runs = Arc::new(AtomicU32::new(0));
    let seen = runs.clone();
    let registry = Arc::new(NodeRegistry::new());
    registry.register_behavior(
        "once",
        Arc::new(FunctionBehavior::new("once", move |_item, _attempt| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(json!("done"))
        })),
    );

    let runtime = Runtime::builder().registry(registry).build();
    runtime
        .register_flow("acct", "single", "name: single\nnodes:\n  only:\n    type: once\n")
        .await
        .unwrap();

    let id = runtime.trigger("acct", "single", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Succeeded);
    assert_eq!(status.results["only"], json!("done"));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn subscription_streams_live_entries() {
    let runtime = Runtime::builder().build();
    runtime
        .register_flow(
            "acct",
            "steady",
            r#"
name: steady
nodes:
  pause:
    type: wait
    params:
      duration_ms: 50
    next:
      default: done
  done:
    type: transform
    params:
      value: "finished"
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "steady", Value::Null).await.unwrap();
    let mut subscription = runtime.subscribe("acct", &id).await.unwrap();

    let mut received = Vec::new();
    while let Some(entry) = subscription.recv().await {
        received.push(entry);
    }

    // The stream ended because the execution terminated; entries arrived in
    // seq order and include at least the tail of the walk.
    assert!(!received.is_empty());
    assert!(received.windows(2).all(|w| w[0].seq < w[1].seq));

    let status = wait_terminal(&runtime, "acct", &id).await;
    assert_eq!(status.state, ExecutionState::Succeeded);

    // Subscribing after termination yields an immediately-ended stream.
    let mut late = runtime.subscribe("acct", &id).await.unwrap();
    assert!(late.recv().await.is_none());

    // History is still pageable.
    assert!(!runtime.logs("acct", &id).await.unwrap().is_empty());
}

#[tokio::test]
async fn cross_account_access_is_rejected() {
    let runtime = Runtime::builder().build();
    runtime
        .register_flow("acct", "f", "name: f\nnodes:\n  only:\n    type: echo\n")
        .await
        .unwrap();
    let id = runtime.trigger("acct", "f", Value::Null).await.unwrap();
    wait_terminal(&runtime, "acct", &id).await;

    assert!(matches!(
        runtime.logs("intruder", &id).await.unwrap_err(),
        RuntimeError::Unauthorized(_)
    ));
    assert!(matches!(
        runtime.cancel("intruder", &id).await.unwrap_err(),
        RuntimeError::Unauthorized(_)
    ));
    assert!(matches!(
        runtime.subscribe("intruder", &id).await.unwrap_err(),
        RuntimeError::Unauthorized(_)
    ));
    // The flow itself is invisible to other accounts.
    assert!(matches!(
        runtime.trigger("intruder", "f", Value::Null).await.unwrap_err(),
        RuntimeError::NotFound(_)
    ));
}

#[tokio::test]
async fn unknown_node_type_is_an_invalid_flow() {
    let runtime = Runtime::builder().build();
    let err = runtime
        .register_flow("acct", "f", "name: f\nnodes:\n  only:\n    type: teleport\n")
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidFlow(_)));
}
