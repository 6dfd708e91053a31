//! Scheduler-level behavior: pre-start cancellation, exec fallbacks,
//! lifecycle hooks, and the runaway-cycle guard.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use flowrunner::prelude::*;
use flowrunner::{LogPipeline, Scheduler, SchedulerConfig};

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

#[tokio::test]
async fn cancellation_before_the_first_node_never_enters_it() {
    let registry = Arc::new(NodeRegistry::with_builtins());
    let store = Arc::new(InMemoryExecutionStore::new());
    let pipeline = Arc::new(LogPipeline::new(store.clone()));
    let scheduler = Scheduler::new(registry, pipeline, store.clone());

    let graph = Arc::new(
        FlowGraph::parse_yaml(
            "f",
            "name: f\nnodes:\n  only:\n    type: transform\n    params:\n      value: 1\n",
        )
        .unwrap(),
    );
    let vault = Arc::new(SecretVault::new(
        Arc::new(InMemorySecretStore::new()),
        EncryptionKey::derive("test"),
    ));
    let ctx = Arc::new(FlowContext::new("e-1", "f", "acct", vault, Map::new()));
    let status = ExecutionStatus::new("e-1", "f", "acct");
    store.put_execution(status.clone()).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let final_status = scheduler.run(graph, ctx, status, token).await;

    assert_eq!(final_status.state, ExecutionState::Cancelled);
    assert!(final_status.results.is_empty());
    assert!(final_status.current_node.is_none());
    assert!(final_status.ended_at.is_some());
}

#[tokio::test]
async fn exec_fallback_value_becomes_the_node_result() {
    struct WithFallback;

    #[async_trait]
    impl NodeBehavior for WithFallback {
        async fn exec(
            &self,
            _item: Value,
            _attempt: &AttemptInfo,
            _log: &NodeLogger,
        ) -> Result<Value, NodeError> {
            Err(NodeError::permanent("primary path unavailable"))
        }

        async fn exec_fallback(
            &self,
            _item: Value,
            _error: NodeError,
            _log: &NodeLogger,
        ) -> Result<Value, NodeError> {
            Ok(json!({"source": "fallback"}))
        }
    }

    let registry = Arc::new(NodeRegistry::new());
    registry.register_behavior("guarded", Arc::new(WithFallback));

    let runtime = Runtime::builder().registry(registry).build();
    runtime
        .register_flow("acct", "f", "name: f\nnodes:\n  only:\n    type: guarded\n")
        .await
        .unwrap();

    let id = runtime.trigger("acct", "f", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Succeeded);
    assert_eq!(status.results["only"], json!({"source": "fallback"}));
}

#[tokio::test]
async fn lifecycle_hooks_evaluate_and_log() {
    let runtime = Runtime::builder().build();
    runtime
        .register_flow(
            "acct",
            "hooked",
            r#"
name: hooked
nodes:
  only:
    type: transform
    params:
      value: 1
    hooks:
      on_enter: "${'entering ' + node}"
      on_exit: "${'left with ' + results.only}"
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "hooked", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;
    assert_eq!(status.state, ExecutionState::Succeeded);

    let logs = runtime.logs("acct", &id).await.unwrap();
    let enter = logs
        .iter()
        .find(|e| e.message.contains("on_enter hook"))
        .unwrap();
    assert_eq!(enter.level, LogLevel::Debug);
    assert_eq!(enter.node.as_deref(), Some("only"));
    assert_eq!(enter.data, Some(json!("entering only")));
}

#[tokio::test]
async fn runaway_cycles_hit_the_step_guard() {
    let runtime = Runtime::builder()
        .config(RuntimeConfig {
            scheduler: SchedulerConfig { max_steps: 10 },
            ..RuntimeConfig::default()
        })
        .build();
    runtime
        .register_flow(
            "acct",
            "loop",
            r#"
name: loop
nodes:
  start:
    type: transform
    params:
      value: "spin"
    next:
      default: a
  a:
    type: transform
    params:
      value: "spin"
    next:
      default: b
  b:
    type: transform
    params:
      value: "spin"
    next:
      default: a
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "loop", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Failed);
    assert!(status.error.as_deref().unwrap().contains("maximum steps"));
}

#[tokio::test]
async fn post_picks_the_edge_by_action_label() {
    let registry = Arc::new(NodeRegistry::with_builtins());
    registry.register_behavior(
        "chooser",
        Arc::new(
            FunctionBehavior::new("chooser", |_item, _attempt| Ok(json!("decided")))
                .with_post(|_ctx, _prep, _exec| Ok("left".to_string())),
        ),
    );

    let runtime = Runtime::builder().registry(registry).build();
    runtime
        .register_flow(
            "acct",
            "fork",
            r#"
name: fork
nodes:
  fork:
    type: chooser
    next:
      left: lhs
      right: rhs
  lhs:
    type: transform
    params:
      value: "went left"
  rhs:
    type: transform
    params:
      value: "went right"
"#,
        )
        .await
        .unwrap();

    let id = runtime.trigger("acct", "fork", Value::Null).await.unwrap();
    let status = wait_terminal(&runtime, "acct", &id).await;

    assert_eq!(status.state, ExecutionState::Succeeded);
    assert_eq!(status.results["lhs"], json!("went left"));
    assert!(!status.results.contains_key("rhs"));
}
