//! # Log Pipeline
//!
//! Every log call made by the scheduler or by a node goes through here:
//! the entry is (a) appended to the execution store under its execution ID
//! and (b) fanned out to live subscribers.
//!
//! Fan-out is non-blocking. Subscribers receive entries over a bounded
//! channel; one whose buffer is full is dropped rather than stalling the
//! scheduler, and the drop itself is recorded as a `warn` entry. No lock is
//! held while writing to subscriber channels.
//!
//! Subscribers joining mid-execution only see entries emitted after they
//! join; history is paged through [`crate::storage::ExecutionStore::logs`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::execution::{LogEntry, LogLevel};
use crate::storage::{ExecutionStore, StorageError};

/// Default per-subscriber buffer, in entries.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// A live stream of one execution's log entries.
#[derive(Debug)]
pub struct LogSubscription {
    execution_id: String,
    id: u64,
    rx: mpsc::Receiver<LogEntry>,
}

impl LogSubscription {
    /// Next entry; `None` once the execution terminates (or this subscriber
    /// was dropped for falling behind).
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.rx.recv().await
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// An already-ended stream, handed out when subscribing to an execution
    /// that has reached a terminal state.
    pub(crate) fn closed(execution_id: &str) -> Self {
        let (_tx, rx) = mpsc::channel(1);
        Self {
            execution_id: execution_id.to_string(),
            id: u64::MAX,
            rx,
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LogEntry>,
}

#[derive(Default)]
struct PipelineState {
    /// Per-execution monotone sequence counters.
    seqs: HashMap<String, u64>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    next_subscriber_id: u64,
}

/// Durable append + live fan-out for execution logs.
pub struct LogPipeline {
    store: Arc<dyn ExecutionStore>,
    state: Mutex<PipelineState>,
    buffer: usize,
}

impl LogPipeline {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self::with_buffer(store, DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Pipeline with a custom per-subscriber buffer size.
    pub fn with_buffer(store: Arc<dyn ExecutionStore>, buffer: usize) -> Self {
        Self {
            store,
            state: Mutex::new(PipelineState::default()),
            buffer: buffer.max(1),
        }
    }

    /// Append an entry and fan it out to live subscribers.
    pub async fn emit(
        &self,
        execution_id: &str,
        level: LogLevel,
        node: Option<&str>,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<(), StorageError> {
        let entry = self.next_entry(execution_id, level, node, message.into(), data);
        self.store.append_log(execution_id, entry.clone()).await?;

        let dropped = self.fan_out(execution_id, entry);
        if !dropped.is_empty() {
            warn!(execution = execution_id, count = dropped.len(), "dropped slow log subscribers");
            let notice = self.next_entry(
                execution_id,
                LogLevel::Warn,
                None,
                format!("dropped {} slow log subscriber(s)", dropped.len()),
                None,
            );
            self.store.append_log(execution_id, notice.clone()).await?;
            self.fan_out(execution_id, notice);
        }
        Ok(())
    }

    /// Start receiving entries emitted from this point on.
    pub fn subscribe(&self, execution_id: &str) -> LogSubscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut state = lock(&self.state);
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state
            .subscribers
            .entry(execution_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        LogSubscription {
            execution_id: execution_id.to_string(),
            id,
            rx,
        }
    }

    /// Detach a subscriber and release its resources.
    pub fn unsubscribe(&self, subscription: &LogSubscription) {
        let mut state = lock(&self.state);
        if let Some(subs) = state.subscribers.get_mut(&subscription.execution_id) {
            subs.retain(|s| s.id != subscription.id);
        }
    }

    /// Terminate an execution's streams: all subscriber channels close and
    /// the sequence counter is released.
    pub fn close(&self, execution_id: &str) {
        let mut state = lock(&self.state);
        state.subscribers.remove(execution_id);
        state.seqs.remove(execution_id);
    }

    fn next_entry(
        &self,
        execution_id: &str,
        level: LogLevel,
        node: Option<&str>,
        message: String,
        data: Option<Value>,
    ) -> LogEntry {
        let mut state = lock(&self.state);
        let seq = state.seqs.entry(execution_id.to_string()).or_insert(0);
        let entry = LogEntry {
            seq: *seq,
            timestamp: Utc::now(),
            level,
            node: node.map(str::to_string),
            message,
            data,
        };
        *seq += 1;
        entry
    }

    /// Send to every live subscriber without holding the state lock, then
    /// prune the ones that fell behind or went away. Returns the IDs whose
    /// buffers were full.
    fn fan_out(&self, execution_id: &str, entry: LogEntry) -> Vec<u64> {
        let senders: Vec<(u64, mpsc::Sender<LogEntry>)> = {
            let state = lock(&self.state);
            state
                .subscribers
                .get(execution_id)
                .map(|subs| subs.iter().map(|s| (s.id, s.tx.clone())).collect())
                .unwrap_or_default()
        };
        if senders.is_empty() {
            return Vec::new();
        }

        let mut dropped = Vec::new();
        let mut closed = Vec::new();
        for (id, tx) in senders {
            match tx.try_send(entry.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => dropped.push(id),
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if !dropped.is_empty() || !closed.is_empty() {
            let mut state = lock(&self.state);
            if let Some(subs) = state.subscribers.get_mut(execution_id) {
                subs.retain(|s| !dropped.contains(&s.id) && !closed.contains(&s.id));
            }
        }
        dropped
    }
}

impl std::fmt::Debug for LogPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogPipeline").finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<PipelineState>) -> std::sync::MutexGuard<'_, PipelineState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
