//! # Scheduler / Executor
//!
//! Walks a flow graph from its start node. For each node: resolve the
//! static params through the context, run prep, run exec under the node's
//! batch/retry/timeout policies, run post, record the result, and follow
//! the edge named by the returned action label. Logs are emitted through
//! the pipeline at every step.
//!
//! Failure routing: a permanent failure while resolving params, in prep, or
//! in exec is captured as `{"error": …}` and routed along the node's
//! `error` edge when one exists; otherwise the execution finishes `Failed`.
//! A post failure always fails the execution — post already decided it had
//! a result, so re-routing it would loop.
//!
//! Cancellation is cooperative: the token is checked between node steps and
//! between batch elements, exec futures are raced against it, and it takes
//! precedence over pending retries.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::FlowContext;
use crate::error::RuntimeError;
use crate::execution::{ExecutionState, ExecutionStatus, LogLevel};
use crate::expr::Bindings;
use crate::graph::{BatchPolicy, ERROR_ACTION, FlowGraph, NodeSpec};
use crate::node::{AttemptInfo, NodeBehavior, NodeError, NodeInput, NodeLogger, NodeRegistry};
use crate::pipeline::LogPipeline;
use crate::storage::ExecutionStore;

/// Tuning knobs for the graph walk.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on node steps per execution; flows may contain cycles,
    /// so a runaway walk terminates as an internal failure.
    pub max_steps: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_steps: 1000 }
    }
}

/// Runs one execution from `Pending` to a terminal state.
pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    pipeline: Arc<LogPipeline>,
    executions: Arc<dyn ExecutionStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        pipeline: Arc<LogPipeline>,
        executions: Arc<dyn ExecutionStore>,
    ) -> Self {
        Self::with_config(registry, pipeline, executions, SchedulerConfig::default())
    }

    pub fn with_config(
        registry: Arc<NodeRegistry>,
        pipeline: Arc<LogPipeline>,
        executions: Arc<dyn ExecutionStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            pipeline,
            executions,
            config,
        }
    }

    /// Drive the execution to a terminal state, persist it exactly once,
    /// and close its log streams. Returns the final status.
    #[instrument(skip_all, fields(execution = %status.id, flow = %graph.id))]
    pub async fn run(
        &self,
        graph: Arc<FlowGraph>,
        ctx: Arc<FlowContext>,
        mut status: ExecutionStatus,
        cancel: CancellationToken,
    ) -> ExecutionStatus {
        let outcome = self.walk(&graph, &ctx, &mut status, &cancel).await;

        let execution_id = status.id.clone();
        let (terminal, error) = match outcome {
            Ok(final_result) => {
                info!("execution succeeded");
                self.emit(
                    &execution_id,
                    LogLevel::Info,
                    None,
                    "execution succeeded",
                    Some(summarize(&final_result)),
                )
                .await;
                (ExecutionState::Succeeded, None)
            }
            Err(RuntimeError::Cancelled) => {
                info!("execution cancelled");
                self.emit(
                    &execution_id,
                    LogLevel::Info,
                    None,
                    "execution cancelled",
                    None,
                )
                .await;
                (ExecutionState::Cancelled, None)
            }
            Err(err) => {
                warn!(%err, "execution failed");
                self.emit(
                    &execution_id,
                    LogLevel::Error,
                    None,
                    format!("execution failed: {err}"),
                    None,
                )
                .await;
                (ExecutionState::Failed, Some(err.to_string()))
            }
        };

        status.error = error;
        if let Err(err) = status.transition(terminal) {
            tracing::error!(%err, "terminal transition rejected");
        }
        if let Err(err) = self.executions.put_execution(status.clone()).await {
            tracing::error!(%err, "failed to persist terminal execution status");
        }
        self.pipeline.close(&execution_id);
        status
    }

    /// The graph walk proper. Returns the final result on success.
    async fn walk(
        &self,
        graph: &FlowGraph,
        ctx: &FlowContext,
        status: &mut ExecutionStatus,
        cancel: &CancellationToken,
    ) -> Result<Value, RuntimeError> {
        status.transition(ExecutionState::Running)?;
        self.executions.put_execution(status.clone()).await?;
        self.emit(
            &status.id,
            LogLevel::Info,
            None,
            format!("execution started for flow '{}'", graph.name),
            None,
        )
        .await;

        let mut current = graph.start_node();
        let mut visited: HashSet<String> = HashSet::new();
        let mut steps = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            if steps >= self.config.max_steps {
                return Err(RuntimeError::Internal(format!(
                    "maximum steps exceeded ({})",
                    self.config.max_steps
                )));
            }
            steps += 1;

            self.emit(
                &status.id,
                LogLevel::Info,
                Some(&current.name),
                format!("entering node {}", current.name),
                None,
            )
            .await;
            visited.insert(current.name.clone());
            status.current_node = Some(current.name.clone());
            status.progress = (visited.len() as f64 / graph.node_count() as f64).min(1.0);
            self.executions.put_execution(status.clone()).await?;

            let (result, action) = match self.run_node(current, ctx, cancel).await {
                Ok(step) => step,
                Err(StepError::Fatal(err)) => return Err(err),
                Err(StepError::Routable(RuntimeError::Cancelled)) => {
                    return Err(RuntimeError::Cancelled);
                }
                Err(StepError::Routable(err)) if current.successor(ERROR_ACTION).is_some() => {
                    let failure = json!({ "error": err.to_string() });
                    self.emit(
                        &status.id,
                        LogLevel::Warn,
                        Some(&current.name),
                        format!("node failed, routing '{ERROR_ACTION}' edge: {err}"),
                        None,
                    )
                    .await;
                    (failure, ERROR_ACTION.to_string())
                }
                Err(StepError::Routable(err)) => return Err(err),
            };

            ctx.set_node_result(&current.name, result.clone());
            status.results.insert(current.name.clone(), result.clone());
            self.emit(
                &status.id,
                LogLevel::Info,
                Some(&current.name),
                format!("node {} complete", current.name),
                Some(summarize(&result)),
            )
            .await;

            match current.successor(&action) {
                Some(next) => {
                    current = graph.node(next).ok_or_else(|| {
                        RuntimeError::Internal(format!("validated graph lost node '{next}'"))
                    })?;
                }
                None => {
                    debug!(node = %current.name, action, "no successor, terminating");
                    return Ok(result);
                }
            }
        }
    }

    /// One node step: params → prep → exec (batch/retry) → post.
    ///
    /// Failures up to and including exec are routable along the node's
    /// `error` edge; a failure in post (or the exit hook) is fatal because
    /// the node already produced its result.
    async fn run_node(
        &self,
        spec: &NodeSpec,
        ctx: &FlowContext,
        cancel: &CancellationToken,
    ) -> Result<(Value, String), StepError> {
        let behavior = self.registry.instantiate(spec).map_err(StepError::Fatal)?;
        let log = NodeLogger::new(self.pipeline.clone(), ctx.execution_id(), &spec.name);

        self.run_hook(spec, ctx, &log, spec.hooks.on_enter.as_deref(), "on_enter")
            .await
            .map_err(StepError::Routable)?;

        let params = ctx
            .evaluate_params(&spec.params)
            .await
            .map_err(StepError::Routable)?;
        let input = NodeInput::new(params, ctx.shared_snapshot());

        let prep = behavior
            .prep(ctx, &input, &log)
            .await
            .map_err(|source| {
                StepError::Routable(RuntimeError::NodeExec {
                    node: spec.name.clone(),
                    source,
                })
            })?;

        let result = self
            .exec_with_policy(spec, &behavior, prep.clone(), cancel, &log)
            .await
            .map_err(StepError::Routable)?;

        let action = behavior
            .post(ctx, &prep, &result, &log)
            .await
            .map_err(|source| {
                StepError::Fatal(RuntimeError::NodeExec {
                    node: spec.name.clone(),
                    source,
                })
            })?;

        self.run_hook(spec, ctx, &log, spec.hooks.on_exit.as_deref(), "on_exit")
            .await
            .map_err(StepError::Fatal)?;

        Ok((result, action))
    }

    /// Evaluate a lifecycle hook script; the value is logged at debug level.
    async fn run_hook(
        &self,
        spec: &NodeSpec,
        ctx: &FlowContext,
        log: &NodeLogger,
        script: Option<&str>,
        which: &str,
    ) -> Result<(), RuntimeError> {
        let Some(script) = script else {
            return Ok(());
        };
        let mut extra = Bindings::new();
        extra.insert("node".to_string(), Value::String(spec.name.clone()));
        let value = ctx.evaluate_expression_with(script, extra).await?;
        log.debug(&format!("{which} hook evaluated"), Some(value)).await;
        Ok(())
    }

    /// Dispatch exec according to the node's batch policy. For batch
    /// policies, prep must have produced a sequence; the node's result is
    /// the sequence of per-element results in input order.
    async fn exec_with_policy(
        &self,
        spec: &NodeSpec,
        behavior: &Arc<dyn NodeBehavior>,
        prep: Value,
        cancel: &CancellationToken,
        log: &NodeLogger,
    ) -> Result<Value, RuntimeError> {
        if spec.batch == BatchPolicy::None {
            return self.exec_with_retry(spec, behavior, prep, cancel, log).await;
        }

        let Value::Array(items) = prep else {
            return Err(RuntimeError::NodeExec {
                node: spec.name.clone(),
                source: NodeError::permanent(
                    "batch node prep must return a sequence of items",
                ),
            });
        };

        let results = match spec.batch {
            BatchPolicy::Serial | BatchPolicy::Async => {
                let cooperative = spec.batch == BatchPolicy::Async;
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    if cancel.is_cancelled() {
                        return Err(RuntimeError::Cancelled);
                    }
                    results.push(
                        self.exec_with_retry(spec, behavior, item, cancel, log).await?,
                    );
                    if cooperative {
                        tokio::task::yield_now().await;
                    }
                }
                results
            }
            BatchPolicy::Parallel => {
                try_join_all(items.into_iter().map(|item| {
                    self.exec_with_retry(spec, behavior, item, cancel, log)
                }))
                .await?
            }
            BatchPolicy::WorkerPool { max_parallel } => {
                let gate = Arc::new(Semaphore::new(max_parallel));
                try_join_all(items.into_iter().map(|item| {
                    let gate = gate.clone();
                    async move {
                        let _permit = gate.acquire().await.map_err(|_| {
                            RuntimeError::Internal("worker pool gate closed".into())
                        })?;
                        self.exec_with_retry(spec, behavior, item, cancel, log).await
                    }
                }))
                .await?
            }
            BatchPolicy::None => unreachable!("handled above"),
        };

        Ok(Value::Array(results))
    }

    /// Run exec for one item under the retry policy and per-attempt
    /// deadline. Cancellation takes precedence over pending retries; a
    /// permanently failed exec gets one shot at the behavior's fallback.
    async fn exec_with_retry(
        &self,
        spec: &NodeSpec,
        behavior: &Arc<dyn NodeBehavior>,
        item: Value,
        cancel: &CancellationToken,
        log: &NodeLogger,
    ) -> Result<Value, RuntimeError> {
        let max_attempts = spec.retry.attempts();
        let mut attempt = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }

            let info = AttemptInfo {
                attempt,
                max_attempts,
                deadline: spec.timeout,
                cancel: cancel.child_token(),
            };
            let exec = async {
                match spec.timeout {
                    Some(deadline) => {
                        match timeout(deadline, behavior.exec(item.clone(), &info, log)).await {
                            Ok(result) => result,
                            Err(_) => Err(NodeError::Timeout(deadline)),
                        }
                    }
                    None => behavior.exec(item.clone(), &info, log).await,
                }
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                result = exec => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(NodeError::Cancelled) => return Err(RuntimeError::Cancelled),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    log.warn(
                        &format!(
                            "attempt {attempt}/{max_attempts} failed, retrying: {err}"
                        ),
                        None,
                    )
                    .await;
                    if !spec.retry.wait.is_zero() {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                            _ = sleep(spec.retry.wait) => {}
                        }
                    }
                    attempt += 1;
                }
                Err(err) => {
                    log.error(
                        &format!("exec failed permanently after {attempt} attempt(s): {err}"),
                        None,
                    )
                    .await;
                    return match behavior.exec_fallback(item, err, log).await {
                        Ok(value) => {
                            log.info("fallback produced a result", Some(summarize(&value)))
                                .await;
                            Ok(value)
                        }
                        Err(source) => Err(RuntimeError::NodeExec {
                            node: spec.name.clone(),
                            source,
                        }),
                    };
                }
            }
        }
    }

    /// Emit a flow-level or node-level log entry; append failures only warn
    /// the ambient log so a flaky store cannot wedge the walk twice.
    async fn emit(
        &self,
        execution_id: &str,
        level: LogLevel,
        node: Option<&str>,
        message: impl Into<String>,
        data: Option<Value>,
    ) {
        if let Err(err) = self
            .pipeline
            .emit(execution_id, level, node, message, data)
            .await
        {
            tracing::warn!(%err, "failed to append execution log entry");
        }
    }
}

/// How a node-step failure propagates: routable failures may follow the
/// node's `error` edge, fatal ones abort the walk.
enum StepError {
    Routable(RuntimeError),
    Fatal(RuntimeError),
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Compact structured summary of a node result for log entries.
fn summarize(value: &Value) -> Value {
    match value {
        Value::Array(items) => json!({ "kind": "sequence", "items": items.len() }),
        Value::Object(map) => {
            json!({ "kind": "mapping", "keys": map.keys().cloned().collect::<Vec<_>>() })
        }
        scalar => json!({ "kind": "scalar", "value": scalar }),
    }
}
