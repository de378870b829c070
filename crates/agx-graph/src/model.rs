//! Wire model for graphs, nodes, and edges.
//!
//! The cloud speaks camelCase JSON; status and type vocabularies are
//! lowercase strings. Unknown vocabulary values round-trip untouched so a
//! newer server never loses data through an older client.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_MODE: &str = "PROJECT";
pub const DEFAULT_MAX_CONCURRENT: u32 = 2;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 5_000;
pub const DEFAULT_RETRY_ON_EXHAUST: &str = "escalate";

macro_rules! string_vocab {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? } fallback $fallback:ident) => {
        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::$fallback(raw) => raw,
                }
            }

            /// Case-insensitive, whitespace-tolerant parse; unknown values
            /// are preserved lowercased.
            pub fn parse(raw: &str) -> Self {
                let normalized = raw.trim().to_ascii_lowercase();
                match normalized.as_str() {
                    $($text => Self::$variant,)+
                    _ => Self::$fallback(normalized),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Ok(Self::parse(&raw))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeType {
    Work,
    Gate,
    Root,
    Fork,
    Join,
    Conditional,
    Other(String),
}

string_vocab!(NodeType {
    Work => "work",
    Gate => "gate",
    Root => "root",
    Fork => "fork",
    Join => "join",
    Conditional => "conditional",
} fallback Other);

impl Default for NodeType {
    fn default() -> Self {
        Self::Work
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeStatus {
    Pending,
    Running,
    AwaitingHuman,
    Done,
    Passed,
    Failed,
    Blocked,
    Skipped,
    Other(String),
}

string_vocab!(NodeStatus {
    Pending => "pending",
    Running => "running",
    AwaitingHuman => "awaiting_human",
    Done => "done",
    Passed => "passed",
    Failed => "failed",
    Blocked => "blocked",
    Skipped => "skipped",
} fallback Other);

impl Default for NodeStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GateType {
    ApprovalGate,
    QualityGate,
    HandoffGate,
    Progress,
    Other(String),
}

string_vocab!(GateType {
    ApprovalGate => "approval_gate",
    QualityGate => "quality_gate",
    HandoffGate => "handoff_gate",
    Progress => "progress",
} fallback Other);

impl Default for GateType {
    fn default() -> Self {
        Self::Progress
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeType {
    #[default]
    Hard,
    Soft,
}

impl EdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "soft" => Self::Soft,
            _ => Self::Hard,
        }
    }
}

impl Serialize for EdgeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EdgeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeCondition {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
}

impl EdgeCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnSuccess => "on_success",
            Self::OnFailure => "on_failure",
            Self::Always => "always",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "on_failure" => Self::OnFailure,
            "always" => Self::Always,
            _ => Self::OnSuccess,
        }
    }
}

impl Serialize for EdgeCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EdgeCondition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StrategyType {
    #[default]
    Auto,
    Human,
}

impl StrategyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Human => "human",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "human" => Self::Human,
            _ => Self::Auto,
        }
    }
}

impl Serialize for StrategyType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StrategyType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub backoff_ms: u64,
    pub on_exhaust: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            on_exhaust: DEFAULT_RETRY_ON_EXHAUST.to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationStrategy {
    #[serde(rename = "type")]
    pub kind: StrategyType,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationResult {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_graph: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub draft_node_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub draft_sink_node_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub deps: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_type: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate_minutes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_minutes: Option<u64>,
    #[serde(rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub where_: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub what_changes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub todos: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verification: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<NodeOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_type: Option<GateType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_strategy: Option<VerificationStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationResult>,
    pub verify_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_by_plan_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_node_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_created: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            ..Self::default()
        }
    }

    pub fn is_work(&self) -> bool {
        self.node_type == NodeType::Work
    }

    pub fn is_gate(&self) -> bool {
        self.node_type == NodeType::Gate
    }

    pub fn strategy_kind(&self) -> StrategyType {
        self.verification_strategy
            .as_ref()
            .map(|strategy| strategy.kind)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub condition: EdgeCondition,
}

impl Edge {
    pub fn hard(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            edge_type: EdgeType::Hard,
            condition: EdgeCondition::OnSuccess,
        }
    }

    /// Fingerprint for de-duplication.
    pub fn key(&self) -> (String, String, EdgeType, EdgeCondition) {
        (
            self.from.clone(),
            self.to.clone(),
            self.edge_type,
            self.condition,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    pub max_concurrent: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DoneCriteria {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub completion_sink_node_ids: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Append-only audit record of a scheduler transition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphRuntimeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub node_id: String,
    pub from_status: String,
    pub to_status: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GraphRuntimeEvent {
    pub fn node_status(
        node_id: &str,
        from: &NodeStatus,
        to: &NodeStatus,
        timestamp: &str,
        reason: &str,
    ) -> Self {
        Self {
            kind: "node_status".to_string(),
            node_id: node_id.to_string(),
            from_status: from.as_str().to_string(),
            to_status: to.as_str().to_string(),
            timestamp: timestamp.to_string(),
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Graph {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub graph_version: u64,
    pub mode: String,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    pub policy: Policy,
    pub done_criteria: DoneCriteria,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub runtime_events: Vec<GraphRuntimeEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timed_out_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Graph {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            graph_version: 1,
            mode: DEFAULT_MODE.to_string(),
            ..Self::default()
        }
    }

    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.to == node_id)
    }

    /// The edge carrying dependency semantics from `dep_id` to `node_id`,
    /// when one is declared.
    pub fn dep_edge(&self, dep_id: &str, node_id: &str) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|edge| edge.from == dep_id && edge.to == node_id)
    }
}
