//! # Flow Graph Model
//!
//! A flow is a directed graph of named nodes with action-labelled edges.
//! The registry stores flow definitions as YAML blobs; [`FlowGraph::parse_yaml`]
//! turns a blob into a validated graph at trigger time. Validation enforces:
//!
//! - exactly one start node (the unique node no edge points at),
//! - every successor references an existing node,
//! - batch and retry policies are well-formed.
//!
//! Unknown node *types* are checked separately against the behavior registry
//! ([`FlowGraph::validate_kinds`]) so the graph model stays independent of
//! which behaviors a runtime happens to register.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RuntimeError;

/// Action label used when a node's post phase returns an empty string.
pub const DEFAULT_ACTION: &str = "default";

/// Edge label consulted when a node fails permanently.
pub const ERROR_ACTION: &str = "error";

/// Retry policy for a node's exec phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Clamped to at least one.
    pub max_attempts: u32,
    /// Wait between attempts.
    pub wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            wait: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Attempts actually performed: a zero policy still runs once.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Concurrency discipline applied when prep yields a sequence of items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchPolicy {
    /// Prep's value goes to exec as-is; no fan-out.
    #[default]
    None,
    /// Strictly sequential, in input order.
    Serial,
    /// Sequential with a cooperative yield between elements.
    Async,
    /// Unbounded concurrent fan-out; results collected in input order.
    Parallel,
    /// Bounded fan-out: at most `max_parallel` execs in flight.
    WorkerPool { max_parallel: usize },
}

impl BatchPolicy {
    /// Whether prep is expected to return a sequence of per-item inputs.
    pub fn is_batch(&self) -> bool {
        !matches!(self, BatchPolicy::None)
    }
}

/// Optional lifecycle hook scripts, evaluated against the flow context when
/// the node is entered and after it completes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeHooks {
    pub on_enter: Option<String>,
    pub on_exit: Option<String>,
}

/// Immutable description of one node: type tag, parameters (possibly holding
/// unresolved `${…}` templates), policies, and successor edges keyed by
/// action label. Instances are shared across executions; all per-execution
/// state lives in the flow context.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub kind: String,
    pub params: Map<String, Value>,
    pub retry: RetryPolicy,
    pub batch: BatchPolicy,
    /// Per-attempt deadline for exec.
    pub timeout: Option<Duration>,
    pub hooks: NodeHooks,
    /// Action label → successor node name.
    pub successors: HashMap<String, String>,
}

impl NodeSpec {
    /// Look up the successor for an action label; empty labels route along
    /// [`DEFAULT_ACTION`].
    pub fn successor(&self, action: &str) -> Option<&str> {
        let label = if action.is_empty() { DEFAULT_ACTION } else { action };
        self.successors.get(label).map(String::as_str)
    }
}

/// A parsed, validated flow graph.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    nodes: HashMap<String, NodeSpec>,
    start: String,
}

impl FlowGraph {
    /// Parse a YAML flow definition and validate its graph structure.
    pub fn parse_yaml(flow_id: &str, source: &str) -> Result<Self, RuntimeError> {
        let definition: FlowDefinition = serde_yaml::from_str(source)
            .map_err(|e| RuntimeError::InvalidFlow(format!("malformed definition: {e}")))?;
        Self::from_definition(flow_id, definition)
    }

    /// Build a graph from an already-deserialized definition.
    pub fn from_definition(
        flow_id: &str,
        definition: FlowDefinition,
    ) -> Result<Self, RuntimeError> {
        if definition.nodes.is_empty() {
            return Err(RuntimeError::InvalidFlow("flow has no nodes".into()));
        }

        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        for (name, def) in &definition.nodes {
            nodes.insert(name.clone(), def.to_spec(name)?);
        }

        // Every successor must name an existing node.
        for spec in nodes.values() {
            for (action, target) in &spec.successors {
                if !nodes.contains_key(target) {
                    return Err(RuntimeError::InvalidFlow(format!(
                        "node '{}' routes action '{}' to unknown node '{}'",
                        spec.name, action, target
                    )));
                }
            }
        }

        // The start node is the unique node no edge points at.
        let mut referenced: HashMap<&str, ()> = HashMap::new();
        for spec in nodes.values() {
            for target in spec.successors.values() {
                referenced.insert(target.as_str(), ());
            }
        }
        let mut starts: Vec<&str> = nodes
            .keys()
            .map(String::as_str)
            .filter(|name| !referenced.contains_key(name))
            .collect();
        starts.sort_unstable();
        let start = match starts.as_slice() {
            [only] => only.to_string(),
            [] => {
                return Err(RuntimeError::InvalidFlow(
                    "no start node: every node is referenced as a successor".into(),
                ));
            }
            many => {
                return Err(RuntimeError::InvalidFlow(format!(
                    "multiple start nodes: {}",
                    many.join(", ")
                )));
            }
        };

        Ok(Self {
            id: flow_id.to_string(),
            name: definition.name,
            description: definition.description,
            version: definition.version.unwrap_or_else(|| "1".to_string()),
            nodes,
            start,
        })
    }

    pub fn start_node(&self) -> &NodeSpec {
        &self.nodes[&self.start]
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Reject node type tags the given predicate does not recognise.
    pub fn validate_kinds(&self, known: impl Fn(&str) -> bool) -> Result<(), RuntimeError> {
        for spec in self.nodes.values() {
            if !known(&spec.kind) {
                return Err(RuntimeError::InvalidFlow(format!(
                    "node '{}' has unknown type '{}'",
                    spec.name, spec.kind
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// YAML definition model
// ---------------------------------------------------------------------------

/// Serialized shape of a flow definition as stored in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Node name → definition. A BTreeMap keeps serialization stable.
    pub nodes: BTreeMap<String, NodeDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HooksDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub next: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDef {
    pub max_attempts: u32,
    #[serde(default)]
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDef {
    pub mode: BatchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    None,
    Serial,
    Async,
    Parallel,
    WorkerPool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_enter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,
}

impl NodeDef {
    fn to_spec(&self, name: &str) -> Result<NodeSpec, RuntimeError> {
        let retry = match &self.retry {
            Some(def) => RetryPolicy {
                max_attempts: def.max_attempts,
                wait: Duration::from_millis(def.wait_ms),
            },
            None => RetryPolicy::default(),
        };

        let batch = match &self.batch {
            None => BatchPolicy::None,
            Some(def) => match def.mode {
                BatchMode::None => BatchPolicy::None,
                BatchMode::Serial => BatchPolicy::Serial,
                BatchMode::Async => BatchPolicy::Async,
                BatchMode::Parallel => BatchPolicy::Parallel,
                BatchMode::WorkerPool => {
                    let max_parallel = def.max_parallel.unwrap_or(0);
                    if max_parallel < 1 {
                        return Err(RuntimeError::InvalidFlow(format!(
                            "node '{name}': worker_pool batch requires max_parallel >= 1"
                        )));
                    }
                    BatchPolicy::WorkerPool { max_parallel }
                }
            },
        };

        Ok(NodeSpec {
            name: name.to_string(),
            kind: self.kind.clone(),
            params: self.params.clone(),
            retry,
            batch,
            timeout: self.timeout_ms.map(Duration::from_millis),
            hooks: self
                .hooks
                .as_ref()
                .map(|h| NodeHooks {
                    on_enter: h.on_enter.clone(),
                    on_exit: h.on_exit.clone(),
                })
                .unwrap_or_default(),
            successors: self
                .next
                .iter()
                .map(|(action, target)| (action.clone(), target.clone()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"
name: linear
nodes:
  start:
    type: http.request
    params:
      url: "https://example.com"
    next:
      default: end
  end:
    type: webhook
"#;

    #[test]
    fn parses_a_linear_flow_and_infers_the_start_node() {
        let graph = FlowGraph::parse_yaml("f-1", LINEAR).unwrap();
        assert_eq!(graph.start_node().name, "start");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.start_node().successor(""), Some("end"));
        assert_eq!(graph.start_node().successor("default"), Some("end"));
        assert_eq!(graph.node("end").unwrap().successor("default"), None);
    }

    #[test]
    fn rejects_multiple_start_nodes() {
        let src = r#"
name: forked
nodes:
  a:
    type: echo
  b:
    type: echo
"#;
        let err = FlowGraph::parse_yaml("f", src).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidFlow(msg) if msg.contains("multiple start")));
    }

    #[test]
    fn rejects_flow_with_no_start_node() {
        let src = r#"
name: ouroboros
nodes:
  a:
    type: echo
    next:
      default: b
  b:
    type: echo
    next:
      default: a
"#;
        let err = FlowGraph::parse_yaml("f", src).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidFlow(msg) if msg.contains("no start node")));
    }

    #[test]
    fn rejects_dangling_successor() {
        let src = r#"
name: broken
nodes:
  a:
    type: echo
    next:
      default: ghost
"#;
        let err = FlowGraph::parse_yaml("f", src).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidFlow(msg) if msg.contains("ghost")));
    }

    #[test]
    fn parses_policies() {
        let src = r#"
name: policies
nodes:
  fanout:
    type: echo
    retry:
      max_attempts: 3
      wait_ms: 50
    batch:
      mode: worker_pool
      max_parallel: 4
    timeout_ms: 2000
"#;
        let graph = FlowGraph::parse_yaml("f", src).unwrap();
        let spec = graph.node("fanout").unwrap();
        assert_eq!(spec.retry.max_attempts, 3);
        assert_eq!(spec.retry.wait, Duration::from_millis(50));
        assert_eq!(spec.batch, BatchPolicy::WorkerPool { max_parallel: 4 });
        assert_eq!(spec.timeout, Some(Duration::from_millis(2000)));
    }

    #[test]
    fn worker_pool_requires_max_parallel() {
        let src = r#"
name: bad
nodes:
  fanout:
    type: echo
    batch:
      mode: worker_pool
"#;
        assert!(FlowGraph::parse_yaml("f", src).is_err());
    }

    #[test]
    fn validates_kinds_against_a_registry_predicate() {
        let graph = FlowGraph::parse_yaml("f-1", LINEAR).unwrap();
        assert!(graph.validate_kinds(|kind| kind == "http.request" || kind == "webhook").is_ok());
        let err = graph.validate_kinds(|kind| kind == "webhook").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidFlow(msg) if msg.contains("http.request")));
    }

    #[test]
    fn zero_retry_policy_still_runs_once() {
        assert_eq!(RetryPolicy { max_attempts: 0, wait: Duration::ZERO }.attempts(), 1);
    }
}
