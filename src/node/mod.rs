//! # Node Contract
//!
//! Every node type, regardless of what it does, exposes the same three-phase
//! surface:
//!
//! | phase | input | output |
//! |---|---|---|
//! | prep | flow context + combined `{params, input}` | prepared value `P` |
//! | exec | `P` (or one batch element of it) | result value `E` |
//! | post | context, `P`, `E` | action label |
//!
//! The scheduler resolves `${…}` templates in the node's static params
//! before prep, wraps exec in the node's retry/batch/timeout policies, and
//! stores `E` as the node's result. Behaviors are immutable descriptions —
//! safe to share across executions; per-execution state lives in the
//! [`FlowContext`].
//!
//! [`NodeRegistry`] maps type tags to behavior factories;
//! [`FunctionBehavior`] builds a behavior from plain closures for tests and
//! embedders.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::context::FlowContext;
use crate::error::RuntimeError;
use crate::execution::LogLevel;
use crate::graph::NodeSpec;
use crate::pipeline::LogPipeline;

#[cfg(feature = "builtin-nodes")]
pub mod builtin;


/// Failure raised by a node phase. The retryable/permanent split drives the
/// scheduler's retry policy; a deadline expiry counts as retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Permanent(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        NodeError::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        NodeError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeError::Retryable(_) | NodeError::Timeout(_))
    }
}

/// The combined input a node receives before prep: resolved static params
/// on one side, the incoming shared data on the other. Node types read
/// either side deterministically.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct NodeInput {
    pub params: Map<String, Value>,
    pub input: Map<String, Value>,
}

impl NodeInput {
    pub fn new(params: Map<String, Value>, input: Map<String, Value>) -> Self {
        Self { params, input }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn input_value(&self, key: &str) -> Option<&Value> {
        self.input.get(key)
    }

    /// The `{params, input}` mapping as a single value, the default prep
    /// result.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(2);
        map.insert("params".to_string(), Value::Object(self.params.clone()));
        map.insert("input".to_string(), Value::Object(self.input.clone()));
        Value::Object(map)
    }
}

/// Attempt metadata handed to exec: which attempt this is, the per-attempt
/// deadline, and the cancellation signal long-running work must honour.
#[derive(Debug, Clone)]
pub struct AttemptInfo {
    /// 1-based attempt counter.
    pub attempt: u32,
    pub max_attempts: u32,
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl AttemptInfo {
    pub fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Logging handle given to nodes; entries are routed to the log pipeline
/// with the node's name attached. Log failures never fail the node.
#[derive(Clone)]
pub struct NodeLogger {
    pipeline: Arc<LogPipeline>,
    execution_id: String,
    node: String,
}

impl NodeLogger {
    pub(crate) fn new(
        pipeline: Arc<LogPipeline>,
        execution_id: impl Into<String>,
        node: impl Into<String>,
    ) -> Self {
        Self {
            pipeline,
            execution_id: execution_id.into(),
            node: node.into(),
        }
    }

    pub async fn log(&self, level: LogLevel, message: &str, data: Option<Value>) {
        if let Err(err) = self
            .pipeline
            .emit(&self.execution_id, level, Some(&self.node), message, data)
            .await
        {
            tracing::warn!(node = %self.node, %err, "failed to append node log entry");
        }
    }

    pub async fn debug(&self, message: &str, data: Option<Value>) {
        self.log(LogLevel::Debug, message, data).await;
    }

    pub async fn info(&self, message: &str, data: Option<Value>) {
        self.log(LogLevel::Info, message, data).await;
    }

    pub async fn warn(&self, message: &str, data: Option<Value>) {
        self.log(LogLevel::Warn, message, data).await;
    }

    pub async fn error(&self, message: &str, data: Option<Value>) {
        self.log(LogLevel::Error, message, data).await;
    }
}

/// The uniform three-phase surface every node type implements.
#[async_trait]
pub trait NodeBehavior: Send + Sync {
    /// Gather and shape inputs. Defaults to the combined `{params, input}`
    /// mapping. For batch nodes, return a sequence: exec runs per element.
    async fn prep(
        &self,
        _ctx: &FlowContext,
        input: &NodeInput,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        Ok(input.to_value())
    }

    /// Perform the node's work. Invoked under the retry/batch policy; must
    /// not touch the flow context.
    async fn exec(
        &self,
        item: Value,
        attempt: &AttemptInfo,
        log: &NodeLogger,
    ) -> Result<Value, NodeError>;

    /// Persist side effects and pick the next edge. An empty label routes
    /// along `default`.
    async fn post(
        &self,
        _ctx: &FlowContext,
        _prep: &Value,
        _exec: &Value,
        _log: &NodeLogger,
    ) -> Result<String, NodeError> {
        Ok(String::new())
    }

    /// Invoked once exec has failed permanently; returning `Ok` turns the
    /// fallback value into the node's result. The default re-raises.
    async fn exec_fallback(
        &self,
        _item: Value,
        error: NodeError,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        Err(error)
    }
}

type PrepFn =
    Box<dyn Fn(&FlowContext, &NodeInput) -> Result<Value, NodeError> + Send + Sync>;
type ExecFn = Box<dyn Fn(Value, &AttemptInfo) -> Result<Value, NodeError> + Send + Sync>;
type PostFn =
    Box<dyn Fn(&FlowContext, &Value, &Value) -> Result<String, NodeError> + Send + Sync>;

/// A behavior assembled from plain closures, for quick prototyping and
/// tests.
pub struct FunctionBehavior {
    name: String,
    prep_fn: Option<PrepFn>,
    exec_fn: ExecFn,
    post_fn: Option<PostFn>,
}

impl FunctionBehavior {
    pub fn new<F>(name: impl Into<String>, exec_fn: F) -> Self
    where
        F: Fn(Value, &AttemptInfo) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            prep_fn: None,
            exec_fn: Box::new(exec_fn),
            post_fn: None,
        }
    }

    pub fn with_prep<F>(mut self, prep_fn: F) -> Self
    where
        F: Fn(&FlowContext, &NodeInput) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.prep_fn = Some(Box::new(prep_fn));
        self
    }

    pub fn with_post<F>(mut self, post_fn: F) -> Self
    where
        F: Fn(&FlowContext, &Value, &Value) -> Result<String, NodeError> + Send + Sync + 'static,
    {
        self.post_fn = Some(Box::new(post_fn));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl NodeBehavior for FunctionBehavior {
    async fn prep(
        &self,
        ctx: &FlowContext,
        input: &NodeInput,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        match &self.prep_fn {
            Some(prep) => prep(ctx, input),
            None => Ok(input.to_value()),
        }
    }

    async fn exec(
        &self,
        item: Value,
        attempt: &AttemptInfo,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        (self.exec_fn)(item, attempt)
    }

    async fn post(
        &self,
        ctx: &FlowContext,
        prep: &Value,
        exec: &Value,
        _log: &NodeLogger,
    ) -> Result<String, NodeError> {
        match &self.post_fn {
            Some(post) => post(ctx, prep, exec),
            None => Ok(String::new()),
        }
    }
}

/// Factory producing a behavior for a node spec.
pub type BehaviorFactory =
    Arc<dyn Fn(&NodeSpec) -> Result<Arc<dyn NodeBehavior>, RuntimeError> + Send + Sync>;

/// Maps node type tags to behavior factories. Graph validation rejects
/// specs whose type tag is not registered.
pub struct NodeRegistry {
    factories: RwLock<HashMap<String, BehaviorFactory>>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with the builtin behaviors.
    #[cfg(feature = "builtin-nodes")]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        builtin::register_all(&registry);
        registry
    }

    pub fn register(&self, kind: impl Into<String>, factory: BehaviorFactory) {
        write_lock(&self.factories).insert(kind.into(), factory);
    }

    /// Register a single shared behavior instance for a type tag.
    pub fn register_behavior(&self, kind: impl Into<String>, behavior: Arc<dyn NodeBehavior>) {
        self.register(kind, Arc::new(move |_spec: &NodeSpec| Ok(behavior.clone())));
    }

    pub fn contains(&self, kind: &str) -> bool {
        read_lock(&self.factories).contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = read_lock(&self.factories).keys().cloned().collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn instantiate(&self, spec: &NodeSpec) -> Result<Arc<dyn NodeBehavior>, RuntimeError> {
        let factory = read_lock(&self.factories)
            .get(&spec.kind)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::InvalidFlow(format!(
                    "node '{}' has unknown type '{}'",
                    spec.name, spec.kind
                ))
            })?;
        factory(spec)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
