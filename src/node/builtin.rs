//! Built-in node behaviors.
//!
//! These cover the utility node types a flow needs regardless of external
//! integrations: value transformation, branching, shared-variable writes,
//! logging, waiting, and a passthrough. The heavyweight integrations
//! (HTTP, LLM, email, database, scripting) live outside the runtime and
//! plug in through [`NodeRegistry`](super::NodeRegistry).
//!
//! Static params reach these behaviors already template-resolved, so a
//! `transform` node's `value: "${shared.items.map(x => x * 2)}"` arrives as
//! the computed sequence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::sleep;

use super::{AttemptInfo, NodeBehavior, NodeError, NodeInput, NodeLogger, NodeRegistry};
use crate::context::FlowContext;
use crate::execution::LogLevel;
use crate::expr;

/// Register every builtin behavior under its canonical type tag.
pub fn register_all(registry: &NodeRegistry) {
    registry.register_behavior("transform", Arc::new(TransformBehavior));
    registry.register_behavior("condition", Arc::new(ConditionBehavior));
    registry.register_behavior("set", Arc::new(SetValueBehavior));
    registry.register_behavior("log", Arc::new(LogBehavior));
    registry.register_behavior("wait", Arc::new(WaitBehavior));
    registry.register_behavior("echo", Arc::new(EchoBehavior));
}

/// Emits its (already resolved) `value` param as the node result; with no
/// `value` param the whole param mapping is the result.
pub struct TransformBehavior;

#[async_trait]
impl NodeBehavior for TransformBehavior {
    async fn prep(
        &self,
        _ctx: &FlowContext,
        input: &NodeInput,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        Ok(input
            .param("value")
            .cloned()
            .unwrap_or_else(|| Value::Object(input.params.clone())))
    }

    async fn exec(
        &self,
        item: Value,
        _attempt: &AttemptInfo,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        Ok(item)
    }
}

/// Routes on the truthiness of its `when` param: the `then_action` label
/// (default `"true"`) when truthy, `else_action` (default `"false"`)
/// otherwise.
pub struct ConditionBehavior;

#[async_trait]
impl NodeBehavior for ConditionBehavior {
    async fn prep(
        &self,
        _ctx: &FlowContext,
        input: &NodeInput,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        Ok(Value::Object(input.params.clone()))
    }

    async fn exec(
        &self,
        item: Value,
        _attempt: &AttemptInfo,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        let when = item.get("when").unwrap_or(&Value::Null);
        Ok(Value::Bool(expr::truthy(when)))
    }

    async fn post(
        &self,
        _ctx: &FlowContext,
        prep: &Value,
        exec: &Value,
        _log: &NodeLogger,
    ) -> Result<String, NodeError> {
        let branch = exec.as_bool().unwrap_or(false);
        let label = if branch { "then_action" } else { "else_action" };
        let action = match prep.get(label) {
            Some(Value::String(s)) => s.clone(),
            _ if branch => "true".to_string(),
            _ => "false".to_string(),
        };
        Ok(action)
    }
}

/// Writes its `value` param into the shared data under `key`.
pub struct SetValueBehavior;

#[async_trait]
impl NodeBehavior for SetValueBehavior {
    async fn prep(
        &self,
        _ctx: &FlowContext,
        input: &NodeInput,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        let Some(Value::String(key)) = input.param("key") else {
            return Err(NodeError::permanent("set: missing string param 'key'"));
        };
        let value = input.param("value").cloned().unwrap_or(Value::Null);
        Ok(json!({ "key": key, "value": value }))
    }

    async fn exec(
        &self,
        item: Value,
        _attempt: &AttemptInfo,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        Ok(item.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn post(
        &self,
        ctx: &FlowContext,
        prep: &Value,
        exec: &Value,
        _log: &NodeLogger,
    ) -> Result<String, NodeError> {
        let key = prep
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| NodeError::permanent("set: prep lost the key"))?;
        ctx.set_shared(key, exec.clone());
        Ok(String::new())
    }
}

/// Emits its `message` param through the execution log at the requested
/// `level` (default info), attaching the optional `data` param.
pub struct LogBehavior;

#[async_trait]
impl NodeBehavior for LogBehavior {
    async fn prep(
        &self,
        _ctx: &FlowContext,
        input: &NodeInput,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        Ok(Value::Object(input.params.clone()))
    }

    async fn exec(
        &self,
        item: Value,
        _attempt: &AttemptInfo,
        log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        let message = match item.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err(NodeError::permanent("log: missing param 'message'")),
        };
        let level = match item.get("level").and_then(Value::as_str) {
            Some("debug") => LogLevel::Debug,
            Some("warn") => LogLevel::Warn,
            Some("error") => LogLevel::Error,
            _ => LogLevel::Info,
        };
        log.log(level, &message, item.get("data").cloned()).await;
        Ok(Value::String(message))
    }
}

/// Sleeps for `duration_ms`, honouring cancellation.
pub struct WaitBehavior;

#[async_trait]
impl NodeBehavior for WaitBehavior {
    async fn prep(
        &self,
        _ctx: &FlowContext,
        input: &NodeInput,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        let ms = match input.param("duration_ms") {
            Some(value) => value
                .as_u64()
                .ok_or_else(|| NodeError::permanent("wait: 'duration_ms' must be a non-negative integer"))?,
            None => 0,
        };
        Ok(json!(ms))
    }

    async fn exec(
        &self,
        item: Value,
        attempt: &AttemptInfo,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        let ms = item.as_u64().unwrap_or(0);
        tokio::select! {
            _ = attempt.cancel.cancelled() => Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(ms)) => Ok(json!({ "waited_ms": ms })),
        }
    }
}

/// Returns its combined `{params, input}` mapping unchanged. Useful as a
/// terminal node and in tests.
pub struct EchoBehavior;

#[async_trait]
impl NodeBehavior for EchoBehavior {
    async fn exec(
        &self,
        item: Value,
        _attempt: &AttemptInfo,
        _log: &NodeLogger,
    ) -> Result<Value, NodeError> {
        Ok(item)
    }
}
