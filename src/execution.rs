//! Execution status, the execution state machine, and log entries.
//!
//! An execution is one activation of a flow. Its status record is created in
//! `Pending` before scheduling starts, advanced by the scheduler, and
//! finalised exactly once; terminal states are absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RuntimeError;

/// State of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// Whether `next` is a legal successor in the state machine.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Durable record of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub id: String,
    pub flow_id: String,
    pub account_id: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    /// Set iff the state is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Non-empty iff the state is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last node entered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<String>,
    /// Best-effort completion estimate in `0.0..=1.0`.
    pub progress: f64,
    /// Node name → last result, as recorded by the scheduler.
    #[serde(default)]
    pub results: Map<String, Value>,
}

impl ExecutionStatus {
    pub fn new(
        id: impl Into<String>,
        flow_id: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            flow_id: flow_id.into(),
            account_id: account_id.into(),
            state: ExecutionState::Pending,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            current_node: None,
            progress: 0.0,
            results: Map::new(),
        }
    }

    /// Advance the state machine; illegal transitions are an internal error.
    pub fn transition(&mut self, next: ExecutionState) -> Result<(), RuntimeError> {
        if !self.state.can_transition_to(next) {
            return Err(RuntimeError::Internal(format!(
                "illegal execution state transition {} -> {}",
                self.state, next
            )));
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.progress = if next == ExecutionState::Succeeded { 1.0 } else { self.progress };
        }
        Ok(())
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// One append-only log record for an execution.
///
/// `seq` is assigned by the log pipeline and is strictly increasing within
/// an execution, so ordering survives identical timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Node that produced the entry; `None` for flow-level events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
