//! Parse planner output into a proposed sub-graph.
//!
//! Planner output is free-form text that should contain a JSON graph,
//! possibly inside a markdown code fence. The parser never errors: any
//! malformed output yields `None` so the caller can append diagnostics to the
//! prompt and retry.

use crate::model::{
    DEFAULT_MAX_ATTEMPTS, Edge, GateType, Node, NodeType, StrategyType, VerificationStrategy,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProposedGraph {
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
}

/// Extract the JSON body, tolerating a surrounding ``` fence with an optional
/// language tag. Without a balanced fence the raw text is used as-is.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[open + 3..];
    let body_start = after_open.find('\n').map(|nl| nl + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => trimmed,
    }
}

/// Parse and normalize a proposed graph out of planner output.
pub fn parse_plan_output(raw: &str) -> Option<ProposedGraph> {
    let body = strip_code_fences(raw);
    let value: Value = serde_json::from_str(body).ok()?;
    if !value.is_object() || !value.get("nodes").is_some_and(Value::is_object) {
        return None;
    }
    let mut proposed: ProposedGraph = serde_json::from_value(value).ok()?;

    for (id, node) in proposed.nodes.iter_mut() {
        node.id = id.clone();
        if node.node_type == NodeType::Other("spike".to_string()) {
            node.node_type = NodeType::Work;
            node.work_type.get_or_insert_with(|| "spike".to_string());
        }
        if node.max_attempts == 0 {
            node.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        node.deps.retain(|dep| dep != id);
        if node.node_type == NodeType::Gate {
            let gate_type = node.gate_type.get_or_insert(GateType::Progress).clone();
            node.verification_strategy
                .get_or_insert_with(|| VerificationStrategy {
                    kind: if gate_type == GateType::HandoffGate {
                        StrategyType::Human
                    } else {
                        StrategyType::Auto
                    },
                    checks: Vec::new(),
                });
        }
    }
    Some(proposed)
}
