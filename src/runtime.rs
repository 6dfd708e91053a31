//! # Runtime Facade
//!
//! The entry point outer layers talk to: trigger a flow for an account,
//! then observe the resulting execution through status, logs, a live
//! subscription, or cancel it. Every operation is guarded by the caller's
//! account identity; cross-account access fails with `Unauthorized`.
//!
//! A trigger resolves the flow definition from the registry, parses and
//! validates it, records a `Pending` status, and launches the scheduler in
//! its own task. Re-triggering the same flow with the same input yields
//! independent executions with distinct IDs and contexts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::context::FlowContext;
use crate::error::{Result, RuntimeError};
use crate::execution::{ExecutionStatus, LogEntry};
use crate::graph::FlowGraph;
use crate::node::NodeRegistry;
use crate::pipeline::{LogPipeline, LogSubscription};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::{
    AccountStore, ExecutionStore, FlowStore, InMemoryAccountStore, InMemoryExecutionStore,
    InMemoryFlowStore, InMemorySecretStore, SecretStore,
};
use crate::vault::{EncryptionKey, SecretVault};

/// Tuning knobs for the runtime.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    /// When set, triggers verify the account exists in the account store.
    pub verify_accounts: bool,
}

struct RuntimeInner {
    flows: Arc<dyn FlowStore>,
    accounts: Arc<dyn AccountStore>,
    executions: Arc<dyn ExecutionStore>,
    vault: Arc<SecretVault>,
    registry: Arc<NodeRegistry>,
    pipeline: Arc<LogPipeline>,
    scheduler: Scheduler,
    config: RuntimeConfig,
    /// Cancellation tokens for in-flight executions.
    active: Mutex<HashMap<String, CancellationToken>>,
}

/// The flow execution runtime. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// The secret vault backing this runtime.
    pub fn vault(&self) -> Arc<SecretVault> {
        self.inner.vault.clone()
    }

    /// The behavior registry; embedders register custom node types here.
    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    /// Parse, validate, and store a flow definition; returns the assigned
    /// version label.
    pub async fn register_flow(
        &self,
        account_id: &str,
        flow_id: &str,
        source: &str,
    ) -> Result<String> {
        if account_id.is_empty() || flow_id.is_empty() {
            return Err(RuntimeError::InvalidInput("empty identifier".into()));
        }
        let graph = FlowGraph::parse_yaml(flow_id, source)?;
        graph.validate_kinds(|kind| self.inner.registry.contains(kind))?;
        Ok(self.inner.flows.put_flow(account_id, flow_id, source).await?)
    }

    /// Trigger a flow. Returns the new execution's ID; the execution runs
    /// in its own task.
    #[instrument(skip(self, input), fields(account = account_id, flow = flow_id))]
    pub async fn trigger(
        &self,
        account_id: &str,
        flow_id: &str,
        input: Value,
    ) -> Result<String> {
        if account_id.is_empty() || flow_id.is_empty() {
            return Err(RuntimeError::InvalidInput("empty identifier".into()));
        }
        let initial_shared = match input {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(RuntimeError::InvalidInput(format!(
                    "trigger input must be a mapping or null, got {other}"
                )));
            }
        };

        if self.inner.config.verify_accounts
            && self.inner.accounts.get_account(account_id).await?.is_none()
        {
            return Err(RuntimeError::Unauthorized(format!(
                "unknown account '{account_id}'"
            )));
        }

        let stored = self
            .inner
            .flows
            .get_flow(account_id, flow_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("flow '{flow_id}'")))?;

        let graph = Arc::new(FlowGraph::parse_yaml(flow_id, &stored.source)?);
        graph.validate_kinds(|kind| self.inner.registry.contains(kind))?;

        let execution_id = Uuid::new_v4().to_string();
        let ctx = Arc::new(FlowContext::new(
            execution_id.clone(),
            flow_id,
            account_id,
            self.inner.vault.clone(),
            initial_shared,
        ));

        let status = ExecutionStatus::new(&execution_id, flow_id, account_id);
        self.inner.executions.put_execution(status.clone()).await?;

        let token = CancellationToken::new();
        {
            let mut active = lock_active(&self.inner.active);
            active.insert(execution_id.clone(), token.clone());
        }

        info!(execution = %execution_id, version = %stored.version, "execution triggered");
        let inner = self.inner.clone();
        let spawned_id = execution_id.clone();
        tokio::spawn(async move {
            inner.scheduler.run(graph, ctx, status, token).await;
            let mut active = lock_active(&inner.active);
            active.remove(&spawned_id);
        });

        Ok(execution_id)
    }

    /// Current status of an execution owned by `account_id`.
    pub async fn status(&self, account_id: &str, execution_id: &str) -> Result<ExecutionStatus> {
        let status = self
            .inner
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("execution '{execution_id}'")))?;
        if status.account_id != account_id {
            return Err(RuntimeError::Unauthorized(format!(
                "execution '{execution_id}' does not belong to account '{account_id}'"
            )));
        }
        Ok(status)
    }

    /// Durable log history for an execution, in order.
    pub async fn logs(&self, account_id: &str, execution_id: &str) -> Result<Vec<LogEntry>> {
        self.status(account_id, execution_id).await?;
        Ok(self.inner.executions.logs(execution_id).await?)
    }

    /// Executions recorded for an account, oldest first.
    pub async fn list_executions(&self, account_id: &str) -> Result<Vec<ExecutionStatus>> {
        Ok(self.inner.executions.list_by_account(account_id).await?)
    }

    /// Live stream of future log entries. History is not replayed; page it
    /// through [`Runtime::logs`]. Subscribing to a finished execution
    /// yields an immediately-ended stream.
    pub async fn subscribe(
        &self,
        account_id: &str,
        execution_id: &str,
    ) -> Result<LogSubscription> {
        let status = self.status(account_id, execution_id).await?;
        if status.state.is_terminal() {
            return Ok(LogSubscription::closed(execution_id));
        }
        Ok(self.inner.pipeline.subscribe(execution_id))
    }

    /// Detach a live subscription.
    pub fn unsubscribe(&self, subscription: &LogSubscription) {
        self.inner.pipeline.unsubscribe(subscription);
    }

    /// Request cooperative cancellation. Idempotent; cancelling a finished
    /// execution is a no-op.
    pub async fn cancel(&self, account_id: &str, execution_id: &str) -> Result<()> {
        let status = self.status(account_id, execution_id).await?;
        if status.state.is_terminal() {
            return Ok(());
        }
        let token = {
            let active = lock_active(&self.inner.active);
            active.get(execution_id).cloned()
        };
        if let Some(token) = token {
            info!(execution = execution_id, "cancellation requested");
            token.cancel();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn lock_active(
    active: &Mutex<HashMap<String, CancellationToken>>,
) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Assembles a [`Runtime`] from stores, a vault key, a behavior registry
/// and configuration; anything not supplied falls back to the in-memory
/// defaults.
#[derive(Default)]
pub struct RuntimeBuilder {
    flows: Option<Arc<dyn FlowStore>>,
    secrets: Option<Arc<dyn SecretStore>>,
    executions: Option<Arc<dyn ExecutionStore>>,
    accounts: Option<Arc<dyn AccountStore>>,
    registry: Option<Arc<NodeRegistry>>,
    encryption_key: Option<EncryptionKey>,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn flow_store(mut self, store: Arc<dyn FlowStore>) -> Self {
        self.flows = Some(store);
        self
    }

    pub fn secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(store);
        self
    }

    pub fn execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.executions = Some(store);
        self
    }

    pub fn account_store(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.accounts = Some(store);
        self
    }

    pub fn registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Runtime {
        let flows = self
            .flows
            .unwrap_or_else(|| Arc::new(InMemoryFlowStore::new()));
        let secrets = self
            .secrets
            .unwrap_or_else(|| Arc::new(InMemorySecretStore::new()));
        let executions = self
            .executions
            .unwrap_or_else(|| Arc::new(InMemoryExecutionStore::new()));
        let accounts = self
            .accounts
            .unwrap_or_else(|| Arc::new(InMemoryAccountStore::new()));

        #[cfg(feature = "builtin-nodes")]
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(NodeRegistry::with_builtins()));
        #[cfg(not(feature = "builtin-nodes"))]
        let registry = self.registry.unwrap_or_else(|| Arc::new(NodeRegistry::new()));

        let vault = Arc::new(SecretVault::new(
            secrets,
            self.encryption_key.unwrap_or_else(EncryptionKey::random),
        ));
        let pipeline = Arc::new(LogPipeline::new(executions.clone()));
        let scheduler = Scheduler::with_config(
            registry.clone(),
            pipeline.clone(),
            executions.clone(),
            self.config.scheduler.clone(),
        );

        Runtime {
            inner: Arc::new(RuntimeInner {
                flows,
                accounts,
                executions,
                vault,
                registry,
                pipeline,
                scheduler,
                config: self.config,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_rejects_bad_input_shapes() {
        let runtime = Runtime::builder().build();
        let err = runtime
            .trigger("acct", "f", Value::String("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidInput(_)));

        let err = runtime.trigger("", "f", Value::Null).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn trigger_unknown_flow_is_not_found() {
        let runtime = Runtime::builder().build();
        let err = runtime.trigger("acct", "ghost", Value::Null).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn register_flow_validates_eagerly() {
        let runtime = Runtime::builder().build();
        let err = runtime
            .register_flow("acct", "bad", "name: bad\nnodes: {}")
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidFlow(_)));
    }

    #[tokio::test]
    async fn account_verification_gates_triggers_when_enabled() {
        let accounts = Arc::new(InMemoryAccountStore::new());
        accounts
            .put_account(crate::storage::Account {
                id: "known".into(),
                name: "Known Tenant".into(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let runtime = Runtime::builder()
            .account_store(accounts)
            .config(RuntimeConfig {
                verify_accounts: true,
                ..RuntimeConfig::default()
            })
            .build();

        let flow = "name: f\nnodes:\n  only:\n    type: echo\n";
        runtime.register_flow("known", "f", flow).await.unwrap();
        runtime.register_flow("ghost", "f", flow).await.unwrap();

        assert!(runtime.trigger("known", "f", Value::Null).await.is_ok());
        assert!(matches!(
            runtime.trigger("ghost", "f", Value::Null).await.unwrap_err(),
            RuntimeError::Unauthorized(_)
        ));
    }

    #[tokio::test]
    async fn status_is_account_guarded() {
        let runtime = Runtime::builder().build();
        runtime
            .register_flow("acct", "f", "name: f\nnodes:\n  only:\n    type: echo\n")
            .await
            .unwrap();
        let id = runtime.trigger("acct", "f", Value::Null).await.unwrap();

        let err = runtime.status("intruder", &id).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Unauthorized(_)));

        let err = runtime.status("acct", "no-such-exec").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }
}
