//! Crate-level error taxonomy.
//!
//! Subsystem errors (`EvalError`, `VaultError`, `StorageError`, `NodeError`)
//! live next to their subsystems and convert into [`RuntimeError`] at the
//! boundary where the runtime surfaces them to callers.

use crate::expr::EvalError;
use crate::node::NodeError;
use crate::storage::StorageError;
use crate::vault::VaultError;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors surfaced by the runtime facade and the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Malformed trigger input or empty identifiers.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown flow, execution, or secret.
    #[error("not found: {0}")]
    NotFound(String),

    /// Account identity mismatch.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Graph validation failure: no start node, multiple start nodes,
    /// dangling successor, unknown node type.
    #[error("invalid flow: {0}")]
    InvalidFlow(String),

    /// Expression failed to parse or referenced an unknown identifier.
    #[error("expression evaluation failed: {0}")]
    Evaluation(#[from] EvalError),

    /// Ciphertext failed authentication during `get` or rotation.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// A node's exec failed permanently (retries exhausted or non-retryable).
    #[error("node '{node}' failed: {source}")]
    NodeExec {
        node: String,
        #[source]
        source: NodeError,
    },

    /// Cooperative cancellation observed.
    #[error("execution cancelled")]
    Cancelled,

    /// Invariant violation or backend unavailability.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<VaultError> for RuntimeError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::InvalidInput(msg) => RuntimeError::InvalidInput(msg),
            VaultError::NotFound(key) => RuntimeError::NotFound(format!("secret '{key}'")),
            VaultError::DecryptionFailed(msg) => RuntimeError::DecryptionFailed(msg),
            VaultError::Storage(err) => RuntimeError::Internal(err.to_string()),
        }
    }
}

impl From<StorageError> for RuntimeError {
    fn from(err: StorageError) -> Self {
        RuntimeError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vault_errors_map_onto_the_taxonomy() {
        let err: RuntimeError = VaultError::NotFound("API_KEY".into()).into();
        assert!(matches!(err, RuntimeError::NotFound(_)));

        let err: RuntimeError = VaultError::DecryptionFailed("bad tag".into()).into();
        assert!(matches!(err, RuntimeError::DecryptionFailed(_)));
    }

    #[test]
    fn display_is_short_and_human_readable() {
        let err = RuntimeError::NodeExec {
            node: "call".into(),
            source: NodeError::permanent("connection refused"),
        };
        assert_eq!(err.to_string(), "node 'call' failed: connection refused");
    }
}
