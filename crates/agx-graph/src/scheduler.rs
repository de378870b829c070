//! The scheduler tick: one pure pass promoting eligible pending nodes to
//! running.

use crate::model::{Graph, GraphRuntimeEvent, NodeStatus, NodeType};
use crate::predicates::can_run;
use std::collections::BTreeSet;

pub const TRANSITION_REASON: &str = "deps_satisfied";

#[derive(Clone, Debug)]
pub struct TickOutcome {
    pub graph: Graph,
    pub events: Vec<GraphRuntimeEvent>,
    /// Node ids promoted this tick, gates first, each in iteration order.
    pub transitioned: Vec<String>,
}

/// Run one scheduler pass over a deep copy of the graph.
///
/// Gates do not count against `policy.maxConcurrent`; every runnable gate is
/// promoted. Work-lane nodes are promoted up to the remaining concurrency
/// budget in iteration order. When `allowed` is given, only those node ids
/// are eligible for the work lane, but gates are still promoted freely.
pub fn tick(graph: &Graph, allowed: Option<&BTreeSet<String>>, now: &str) -> TickOutcome {
    let mut next = graph.clone();

    let running_work_count = next
        .nodes
        .values()
        .filter(|node| node.node_type == NodeType::Work && node.status == NodeStatus::Running)
        .count() as u32;

    let mut runnable_gates = Vec::new();
    let mut runnable_work = Vec::new();
    for (id, node) in &next.nodes {
        if node.status != NodeStatus::Pending || !can_run(&next, node) {
            continue;
        }
        if node.node_type == NodeType::Gate {
            runnable_gates.push(id.clone());
        } else {
            if let Some(allowed) = allowed {
                if !allowed.contains(id) {
                    continue;
                }
            }
            runnable_work.push(id.clone());
        }
    }

    let capacity = next
        .policy
        .max_concurrent
        .saturating_sub(running_work_count) as usize;
    runnable_work.truncate(capacity);

    let mut events = Vec::new();
    let mut transitioned = Vec::new();
    for id in runnable_gates.into_iter().chain(runnable_work) {
        let Some(node) = next.nodes.get_mut(&id) else {
            continue;
        };
        let from = node.status.clone();
        node.status = NodeStatus::Running;
        if node.started_at.is_none() {
            node.started_at = Some(now.to_string());
        }
        events.push(GraphRuntimeEvent::node_status(
            &id,
            &from,
            &NodeStatus::Running,
            now,
            TRANSITION_REASON,
        ));
        transitioned.push(id);
    }
    next.runtime_events.extend(events.iter().cloned());

    TickOutcome {
        graph: next,
        events,
        transitioned,
    }
}
