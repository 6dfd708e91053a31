//! In-memory reference backends, safe for concurrent callers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{
    Account, AccountStore, ExecutionStore, FlowStore, SecretRecord, SecretStore, StorageError,
    StoredFlow,
};
use crate::execution::{ExecutionStatus, LogEntry};

/// Flow registry backed by a map of `(account, flow)` → version list.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    flows: RwLock<HashMap<(String, String), Vec<StoredFlow>>>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn put_flow(
        &self,
        account_id: &str,
        flow_id: &str,
        source: &str,
    ) -> Result<String, StorageError> {
        let mut flows = self.flows.write().await;
        let versions = flows
            .entry((account_id.to_string(), flow_id.to_string()))
            .or_default();
        let version = (versions.len() + 1).to_string();
        versions.push(StoredFlow {
            account_id: account_id.to_string(),
            flow_id: flow_id.to_string(),
            version: version.clone(),
            source: source.to_string(),
            created_at: Utc::now(),
        });
        Ok(version)
    }

    async fn get_flow(
        &self,
        account_id: &str,
        flow_id: &str,
    ) -> Result<Option<StoredFlow>, StorageError> {
        let flows = self.flows.read().await;
        Ok(flows
            .get(&(account_id.to_string(), flow_id.to_string()))
            .and_then(|versions| versions.last().cloned()))
    }

    async fn get_flow_version(
        &self,
        account_id: &str,
        flow_id: &str,
        version: &str,
    ) -> Result<Option<StoredFlow>, StorageError> {
        let flows = self.flows.read().await;
        Ok(flows
            .get(&(account_id.to_string(), flow_id.to_string()))
            .and_then(|versions| versions.iter().find(|f| f.version == version).cloned()))
    }

    async fn list_versions(
        &self,
        account_id: &str,
        flow_id: &str,
    ) -> Result<Vec<String>, StorageError> {
        let flows = self.flows.read().await;
        Ok(flows
            .get(&(account_id.to_string(), flow_id.to_string()))
            .map(|versions| versions.iter().map(|f| f.version.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_flows(&self, account_id: &str) -> Result<Vec<String>, StorageError> {
        let flows = self.flows.read().await;
        let mut ids: Vec<String> = flows
            .keys()
            .filter(|(account, _)| account == account_id)
            .map(|(_, flow_id)| flow_id.clone())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Ciphertext store keyed by `(account, key)`.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    records: RwLock<HashMap<(String, String), SecretRecord>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn put(&self, record: SecretRecord) -> Result<(), StorageError> {
        let mut records = self.records.write().await;
        records.insert((record.account_id.clone(), record.key.clone()), record);
        Ok(())
    }

    async fn get(
        &self,
        account_id: &str,
        key: &str,
    ) -> Result<Option<SecretRecord>, StorageError> {
        let records = self.records.read().await;
        Ok(records
            .get(&(account_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, account_id: &str, key: &str) -> Result<bool, StorageError> {
        let mut records = self.records.write().await;
        Ok(records
            .remove(&(account_id.to_string(), key.to_string()))
            .is_some())
    }

    async fn list_keys(&self, account_id: &str) -> Result<Vec<String>, StorageError> {
        let records = self.records.read().await;
        let mut keys: Vec<String> = records
            .keys()
            .filter(|(account, _)| account == account_id)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn list_all(&self) -> Result<Vec<SecretRecord>, StorageError> {
        let records = self.records.read().await;
        Ok(records.values().cloned().collect())
    }
}

/// Execution status and log storage.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<String, ExecutionStatus>>,
    logs: RwLock<HashMap<String, Vec<LogEntry>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn put_execution(&self, status: ExecutionStatus) -> Result<(), StorageError> {
        let mut executions = self.executions.write().await;
        executions.insert(status.id.clone(), status);
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionStatus>, StorageError> {
        let executions = self.executions.read().await;
        Ok(executions.get(id).cloned())
    }

    async fn list_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<ExecutionStatus>, StorageError> {
        let executions = self.executions.read().await;
        let mut list: Vec<ExecutionStatus> = executions
            .values()
            .filter(|status| status.account_id == account_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(list)
    }

    async fn append_log(&self, execution_id: &str, entry: LogEntry) -> Result<(), StorageError> {
        let mut logs = self.logs.write().await;
        logs.entry(execution_id.to_string()).or_default().push(entry);
        Ok(())
    }

    async fn logs(&self, execution_id: &str) -> Result<Vec<LogEntry>, StorageError> {
        let logs = self.logs.read().await;
        Ok(logs.get(execution_id).cloned().unwrap_or_default())
    }
}

/// Tenant records.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn put_account(&self, account: Account) -> Result<(), StorageError> {
        let mut accounts = self.accounts.write().await;
        accounts.insert(account.id.clone(), account);
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>, StorageError> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(id).cloned())
    }
}
