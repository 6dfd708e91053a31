//! # Flow Context
//!
//! Per-execution mutable state: completed node results, shared variables
//! seeded from the trigger input, and a capability handle to the secret
//! vault. The context builds the binding set (`secrets`, `results`,
//! `shared`) consumed by the expression evaluator.
//!
//! Writes to the two mappings are serialised behind locks that are never
//! held across an await; reads are concurrent-safe. The vault handle is a
//! reference, not ownership — the vault outlives any execution.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::{Map, Value};

use crate::error::RuntimeError;
use crate::expr::{self, Bindings, SecretRefs};
use crate::vault::{SecretVault, VaultError};

/// Per-execution state shared by the scheduler, nodes and the evaluator.
pub struct FlowContext {
    execution_id: String,
    flow_id: String,
    account_id: String,
    results: RwLock<Map<String, Value>>,
    shared: RwLock<Map<String, Value>>,
    vault: Arc<SecretVault>,
}

impl FlowContext {
    pub fn new(
        execution_id: impl Into<String>,
        flow_id: impl Into<String>,
        account_id: impl Into<String>,
        vault: Arc<SecretVault>,
        initial_shared: Map<String, Value>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            flow_id: flow_id.into(),
            account_id: account_id.into(),
            results: RwLock::new(Map::new()),
            shared: RwLock::new(initial_shared),
            vault,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// The sole account whose secrets are reachable from this context.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Record a completed node's result. Called by the scheduler after the
    /// node's post phase; results are only ever added, never removed.
    pub fn set_node_result(&self, node: &str, value: Value) {
        write_lock(&self.results).insert(node.to_string(), value);
    }

    pub fn node_result(&self, node: &str) -> Option<Value> {
        read_lock(&self.results).get(node).cloned()
    }

    pub fn results_snapshot(&self) -> Map<String, Value> {
        read_lock(&self.results).clone()
    }

    pub fn set_shared(&self, key: &str, value: Value) {
        write_lock(&self.shared).insert(key.to_string(), value);
    }

    pub fn shared_value(&self, key: &str) -> Option<Value> {
        read_lock(&self.shared).get(key).cloned()
    }

    pub fn shared_snapshot(&self) -> Map<String, Value> {
        read_lock(&self.shared).clone()
    }

    /// Resolve a template string against this context's bindings.
    pub async fn evaluate_expression(&self, template: &str) -> Result<Value, RuntimeError> {
        self.evaluate_expression_with(template, Bindings::new())
            .await
    }

    /// Resolve a template string with additional caller-supplied bindings.
    /// The reserved names (`secrets`, `results`, `shared`) cannot be
    /// shadowed.
    pub async fn evaluate_expression_with(
        &self,
        template: &str,
        extra: Bindings,
    ) -> Result<Value, RuntimeError> {
        let bindings = self
            .bindings(expr::secret_refs(template), extra)
            .await?;
        Ok(expr::evaluate(template, &bindings)?)
    }

    /// Resolve every `${…}` template inside a parameter mapping.
    pub async fn evaluate_params(
        &self,
        params: &Map<String, Value>,
    ) -> Result<Map<String, Value>, RuntimeError> {
        let refs = params.iter().fold(SecretRefs::None, |acc, (key, value)| {
            acc.merge(expr::secret_refs(key))
                .merge(expr::secret_refs_in_value(value))
        });
        let bindings = self.bindings(refs, Bindings::new()).await?;
        Ok(expr::evaluate_in_object(params, &bindings)?)
    }

    /// Build the evaluator bindings, prefetching exactly the secrets the
    /// expression mentions (the interpreter itself cannot reach the vault).
    async fn bindings(
        &self,
        refs: SecretRefs,
        extra: Bindings,
    ) -> Result<Bindings, RuntimeError> {
        let mut bindings = extra;
        bindings.insert(
            "secrets".to_string(),
            Value::Object(self.fetch_secrets(refs).await?),
        );
        bindings.insert(
            "results".to_string(),
            Value::Object(self.results_snapshot()),
        );
        bindings.insert("shared".to_string(), Value::Object(self.shared_snapshot()));
        Ok(bindings)
    }

    async fn fetch_secrets(&self, refs: SecretRefs) -> Result<Map<String, Value>, RuntimeError> {
        let keys = match refs {
            SecretRefs::None => return Ok(Map::new()),
            SecretRefs::Keys(keys) => keys,
            SecretRefs::All => self.vault.list(&self.account_id).await?,
        };

        let mut secrets = Map::with_capacity(keys.len());
        for key in keys {
            match self.vault.get(&self.account_id, &key).await {
                Ok(plaintext) => {
                    secrets.insert(key, Value::String(plaintext));
                }
                // Absent secrets surface as null on access, not as errors.
                Err(VaultError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(secrets)
    }
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("execution_id", &self.execution_id)
            .field("flow_id", &self.flow_id)
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

/// Lock helpers that recover from poisoning instead of panicking: the maps
/// stay usable even if a writer thread died mid-update.
fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
