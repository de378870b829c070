//! Dependency and completion predicates.

use crate::model::{Edge, EdgeCondition, EdgeType, Graph, Node, NodeStatus};

/// Statuses that satisfy an `on_success` hard dependency.
pub fn is_success(status: &NodeStatus) -> bool {
    matches!(
        status,
        NodeStatus::Done | NodeStatus::Passed | NodeStatus::Skipped
    )
}

/// Statuses that satisfy an `on_failure` hard dependency.
pub fn is_failure(status: &NodeStatus) -> bool {
    matches!(status, NodeStatus::Failed)
}

/// Terminal statuses. Unknown vocabulary values are conservatively
/// non-terminal.
pub fn is_terminal(status: &NodeStatus) -> bool {
    matches!(
        status,
        NodeStatus::Done | NodeStatus::Passed | NodeStatus::Failed | NodeStatus::Skipped
    )
}

/// Statuses that keep a graph from being considered complete.
pub fn is_incomplete(status: &NodeStatus) -> bool {
    !is_terminal(status)
}

/// A soft dependency is satisfied once the dep has at least started.
pub fn soft_satisfied(status: &NodeStatus) -> bool {
    !matches!(status, NodeStatus::Pending)
}

fn edge_satisfied(edge_type: EdgeType, condition: EdgeCondition, status: &NodeStatus) -> bool {
    match edge_type {
        EdgeType::Soft => soft_satisfied(status),
        EdgeType::Hard => match condition {
            EdgeCondition::OnSuccess => is_success(status),
            EdgeCondition::OnFailure => is_failure(status),
            EdgeCondition::Always => is_terminal(status),
        },
    }
}

/// Whether one dependency of `node` is satisfied. Deps without a declared
/// edge default to hard `on_success`; deps pointing at unknown nodes never
/// satisfy (normalization strips them, but a raw graph may still carry one).
pub fn dep_satisfied(graph: &Graph, node: &Node, dep_id: &str) -> bool {
    let Some(dep) = graph.nodes.get(dep_id) else {
        return false;
    };
    let (edge_type, condition) = graph
        .dep_edge(dep_id, &node.id)
        .map(|edge: &Edge| (edge.edge_type, edge.condition))
        .unwrap_or_default();
    edge_satisfied(edge_type, condition, &dep.status)
}

/// A node can run once every dependency is satisfied.
pub fn can_run(graph: &Graph, node: &Node) -> bool {
    node.deps.iter().all(|dep| dep_satisfied(graph, node, dep))
}

pub fn has_incomplete_nodes(graph: &Graph) -> bool {
    graph.nodes.values().any(|node| is_incomplete(&node.status))
}

/// Canonical serialization of all node statuses, used for stall detection.
/// Stable across key ordering because `nodes` is an ordered map.
pub fn status_fingerprint(graph: &Graph) -> String {
    graph
        .nodes
        .iter()
        .map(|(id, node)| format!("{id}:{}", node.status))
        .collect::<Vec<_>>()
        .join("|")
}

/// Completion-sink predicate: with no declared sinks the graph is done iff no
/// node failed; otherwise every declared sink must be done or passed.
pub fn completion_sinks_satisfied(graph: &Graph) -> bool {
    let sinks = &graph.done_criteria.completion_sink_node_ids;
    if sinks.is_empty() {
        return !graph
            .nodes
            .values()
            .any(|node| node.status == NodeStatus::Failed);
    }
    sinks.iter().all(|sink| {
        graph
            .nodes
            .get(sink)
            .map(|node| matches!(node.status, NodeStatus::Done | NodeStatus::Passed))
            .unwrap_or(false)
    })
}
