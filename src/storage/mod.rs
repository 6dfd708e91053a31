//! Storage interfaces for the runtime's four externally-pluggable seams:
//!
//! - [`FlowStore`]: versioned YAML flow definitions (read-only during
//!   execution)
//! - [`SecretStore`]: ciphertext records consumed by the vault
//! - [`ExecutionStore`]: execution status plus append-only logs
//! - [`AccountStore`]: tenant records
//!
//! Each backend instance is expected to provide at-least-once durability for
//! writes and read-after-write consistency for the same key. In-memory
//! reference backends live in [`memory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{ExecutionStatus, LogEntry};

mod memory;
pub use memory::{
    InMemoryAccountStore, InMemoryExecutionStore, InMemoryFlowStore, InMemorySecretStore,
};

/// Error type shared by the storage seams.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A stored flow definition: the raw YAML blob plus registry metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFlow {
    pub account_id: String,
    pub flow_id: String,
    pub version: String,
    /// YAML source, parsed by the runtime at trigger time.
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// Registry of flow definitions keyed by account + flow ID + version.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Store a new version of a flow; returns the assigned version label.
    async fn put_flow(
        &self,
        account_id: &str,
        flow_id: &str,
        source: &str,
    ) -> Result<String, StorageError>;

    /// Latest version of a flow, if any.
    async fn get_flow(
        &self,
        account_id: &str,
        flow_id: &str,
    ) -> Result<Option<StoredFlow>, StorageError>;

    /// A specific historical version.
    async fn get_flow_version(
        &self,
        account_id: &str,
        flow_id: &str,
        version: &str,
    ) -> Result<Option<StoredFlow>, StorageError>;

    /// Version labels in creation order.
    async fn list_versions(
        &self,
        account_id: &str,
        flow_id: &str,
    ) -> Result<Vec<String>, StorageError>;

    /// Flow IDs registered for an account.
    async fn list_flows(&self, account_id: &str) -> Result<Vec<String>, StorageError>;
}

/// An encrypted secret at rest. Plaintext never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub account_id: String,
    pub key: String,
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ciphertext storage consumed by the secret vault.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn put(&self, record: SecretRecord) -> Result<(), StorageError>;

    async fn get(&self, account_id: &str, key: &str)
    -> Result<Option<SecretRecord>, StorageError>;

    /// Returns whether a record existed.
    async fn delete(&self, account_id: &str, key: &str) -> Result<bool, StorageError>;

    async fn list_keys(&self, account_id: &str) -> Result<Vec<String>, StorageError>;

    /// Every record across all accounts, for key rotation.
    async fn list_all(&self) -> Result<Vec<SecretRecord>, StorageError>;
}

/// Durable execution status and append-only logs.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create or replace the status record for an execution.
    async fn put_execution(&self, status: ExecutionStatus) -> Result<(), StorageError>;

    async fn get_execution(&self, id: &str) -> Result<Option<ExecutionStatus>, StorageError>;

    async fn list_by_account(
        &self,
        account_id: &str,
    ) -> Result<Vec<ExecutionStatus>, StorageError>;

    async fn append_log(&self, execution_id: &str, entry: LogEntry) -> Result<(), StorageError>;

    /// All entries for an execution, in append order.
    async fn logs(&self, execution_id: &str) -> Result<Vec<LogEntry>, StorageError>;
}

/// A tenant record. Account management itself lives outside the runtime;
/// this seam exists so the facade can verify an account when configured to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn put_account(&self, account: Account) -> Result<(), StorageError>;

    async fn get_account(&self, id: &str) -> Result<Option<Account>, StorageError>;
}
