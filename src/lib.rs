//! # Flowrunner
//!
//! A multi-tenant workflow orchestration runtime. Flows are declarative
//! YAML documents describing a directed graph of nodes; triggering a flow
//! with a runtime input produces an independent **execution** with durable
//! status and logs.
//!
//! Flowrunner models execution as a **Graph + Flow Context**:
//! - **Node**: a unit of work with prep/exec/post phases, retry and batch
//!   policies
//! - **Flow graph**: connects nodes through action-labelled edges
//! - **Flow context**: carries secrets, prior node results and shared data
//!   between nodes, and backs the `${…}` expression templates in node
//!   params
//!
//! ## Architecture
//!
//! ### Core modules
//! - [`graph`]: the flow graph model and its YAML definition format
//! - [`expr`]: the sandboxed expression evaluator behind `${…}` templates
//! - [`context`]: per-execution state and evaluator bindings
//! - [`node`]: the three-phase node contract, registry and builtins
//! - [`scheduler`]: the graph walk with retries, batching and cancellation
//! - [`runtime`]: the facade (trigger / status / logs / subscribe / cancel)
//!
//! ### Services
//! - [`vault`]: per-account authenticated-encryption secret store
//! - [`pipeline`]: durable execution logs with live, lossy fan-out
//! - [`storage`]: the four pluggable backend seams plus in-memory
//!   reference implementations
//!
//! ## Quick start
//!
//! ```rust
//! use flowrunner::prelude::*;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), RuntimeError> {
//! let runtime = Runtime::builder().build();
//! runtime.vault().set("acme", "API_KEY", "k-1").await?;
//!
//! runtime
//!     .register_flow(
//!         "acme",
//!         "greet",
//!         r#"
//! name: greet
//! nodes:
//!   greet:
//!     type: transform
//!     params:
//!       value: "${'hello ' + shared.who}"
//! "#,
//!     )
//!     .await?;
//!
//! let execution = runtime.trigger("acme", "greet", json!({"who": "world"})).await?;
//! # let _ = execution;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Each execution runs in its own task; within one execution the walk is
//! single-threaded, and concurrency only appears inside a node's batch
//! policy (serial, async, parallel, or a bounded worker pool). Cancellation
//! is cooperative and takes precedence over pending retries.

pub mod context;
pub mod error;
pub mod execution;
pub mod expr;
pub mod graph;
pub mod node;
pub mod pipeline;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod vault;

// ============================================================================
// CORE RE-EXPORTS
// ============================================================================

pub use context::FlowContext;
pub use error::{Result, RuntimeError};
pub use execution::{ExecutionState, ExecutionStatus, LogEntry, LogLevel};
pub use expr::{Bindings, EvalError};
pub use graph::{BatchPolicy, FlowDefinition, FlowGraph, NodeSpec, RetryPolicy};
pub use node::{
    AttemptInfo, FunctionBehavior, NodeBehavior, NodeError, NodeInput, NodeLogger, NodeRegistry,
};
pub use pipeline::{LogPipeline, LogSubscription};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeConfig};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use storage::{
    Account, AccountStore, ExecutionStore, FlowStore, SecretRecord, SecretStore, StorageError,
    StoredFlow,
};
pub use vault::{EncryptionKey, SecretVault, VaultError};

/// Builtin node behaviors (feature: `builtin-nodes`).
#[cfg(feature = "builtin-nodes")]
pub use node::builtin::{
    ConditionBehavior, EchoBehavior, LogBehavior, SetValueBehavior, TransformBehavior,
    WaitBehavior,
};

/// Commonly used external types
pub use serde_json::Value as JsonValue;

/// Convenient re-exports for common types and traits
pub mod prelude {
    pub use crate::{
        AttemptInfo, BatchPolicy, ExecutionState, ExecutionStatus, FlowContext, FlowGraph,
        FunctionBehavior, LogEntry, LogLevel, NodeBehavior, NodeError, NodeInput, NodeLogger,
        NodeRegistry, RetryPolicy, Runtime, RuntimeConfig, RuntimeError,
    };

    pub use crate::storage::{
        AccountStore, ExecutionStore, FlowStore, InMemoryAccountStore, InMemoryExecutionStore,
        InMemoryFlowStore, InMemorySecretStore, SecretStore,
    };

    pub use crate::vault::{EncryptionKey, SecretVault};

    #[cfg(feature = "builtin-nodes")]
    pub use crate::node::builtin::{
        ConditionBehavior, EchoBehavior, LogBehavior, SetValueBehavior, TransformBehavior,
        WaitBehavior,
    };

    pub use serde_json::Value as JsonValue;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn basic_integration() {
        let runtime = Runtime::builder().build();
        runtime
            .register_flow(
                "acct",
                "double",
                r#"
name: double
nodes:
  double:
    type: transform
    params:
      value: "${shared.n * 2}"
"#,
            )
            .await
            .unwrap();

        let id = runtime.trigger("acct", "double", json!({"n": 21})).await.unwrap();
        let status = wait_terminal(&runtime, "acct", &id).await;
        assert_eq!(status.state, ExecutionState::Succeeded);
        assert_eq!(status.results["double"], json!(42));
    }

    async fn wait_terminal(runtime: &Runtime, account: &str, id: &str) -> ExecutionStatus {
        for _ in 0..200 {
            let status = runtime.status(account, id).await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("execution '{id}' did not reach a terminal state");
    }
}
