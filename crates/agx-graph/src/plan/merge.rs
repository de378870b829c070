//! Replace the previously planned subtree with a newly proposed one.
//!
//! Draft nodes from the last plan are deleted unless locked (already done,
//! passed, or skipped); locked nodes are authoritative in the existing graph
//! and must survive a re-plan byte-identically. Inserted nodes are anchored
//! to the plan-approval gate and become the new completion sinks.

use crate::model::{Edge, EdgeCondition, EdgeType, Graph, Node, NodeStatus};
use crate::plan::parse::ProposedGraph;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Forward-reachable node ids from `root`, excluding `root` itself.
pub fn descendants_of(graph: &Graph, root: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut frontier = vec![root.to_string()];
    while let Some(current) = frontier.pop() {
        for edge in graph.outgoing_edges(&current) {
            if edge.to != root && seen.insert(edge.to.clone()) {
                frontier.push(edge.to.clone());
            }
        }
    }
    seen
}

/// Nodes the previous plan owns: everything tagged with its id, plus every
/// descendant of the approval anchor (untagged legacy branches included),
/// minus the plan node and the anchor themselves.
pub fn previous_draft_node_ids(
    graph: &Graph,
    plan_node_id: &str,
    anchor_id: &str,
) -> BTreeSet<String> {
    let mut drafts: BTreeSet<String> = graph
        .nodes
        .values()
        .filter(|node| node.generated_by_plan_node_id.as_deref() == Some(plan_node_id))
        .map(|node| node.id.clone())
        .collect();
    drafts.extend(descendants_of(graph, anchor_id));
    drafts.remove(plan_node_id);
    drafts.remove(anchor_id);
    drafts
}

/// The locked past: previous draft nodes that already completed.
pub fn locked_node_ids(graph: &Graph, drafts: &BTreeSet<String>) -> BTreeSet<String> {
    drafts
        .iter()
        .filter(|id| {
            graph.nodes.get(*id).is_some_and(|node| {
                matches!(
                    node.status,
                    NodeStatus::Done | NodeStatus::Passed | NodeStatus::Skipped
                )
            })
        })
        .cloned()
        .collect()
}

/// Canonical, order-independent form of a node for locked-node comparison.
/// Strips the approval anchor from deps, the attempt counter, and the
/// transient run fields, so two specs compare equal iff they describe the
/// same planned work.
pub fn canonical_node_spec(node: &Node, anchor_id: &str) -> Value {
    let mut spec = node.clone();
    spec.deps.remove(anchor_id);
    spec.attempts = 0;
    spec.status = NodeStatus::Pending;
    spec.started_at = None;
    spec.completed_at = None;
    spec.actual_minutes = None;
    spec.output = None;
    spec.error = None;
    spec.verification_result = None;
    spec.verify_failures = 0;
    spec.generated_by_plan_node_id = None;
    spec.plan_node_key = None;
    serde_json::to_value(&spec).unwrap_or(Value::Null)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanReplacement {
    pub draft_node_ids: Vec<String>,
    pub draft_sink_node_ids: Vec<String>,
    pub id_map: BTreeMap<String, String>,
}

/// Splice a validated proposed sub-graph into the task graph.
pub fn replace_planned_subtree(
    graph: &mut Graph,
    plan_node_id: &str,
    anchor_id: &str,
    proposed: &ProposedGraph,
) -> PlanReplacement {
    let previous = previous_draft_node_ids(graph, plan_node_id, anchor_id);
    let locked = locked_node_ids(graph, &previous);
    let doomed: BTreeSet<String> = previous.difference(&locked).cloned().collect();

    graph.nodes.retain(|id, _| !doomed.contains(id));
    graph
        .edges
        .retain(|edge| !doomed.contains(&edge.from) && !doomed.contains(&edge.to));
    for node in graph.nodes.values_mut() {
        node.deps.retain(|dep| !doomed.contains(dep));
    }

    // Locked ids map to themselves; the existing node stays authoritative.
    let mut id_map: BTreeMap<String, String> = locked
        .iter()
        .map(|id| (id.clone(), id.clone()))
        .collect();

    let mut inserted: Vec<String> = Vec::new();
    for (source_id, node) in &proposed.nodes {
        if locked.contains(source_id) {
            continue;
        }
        let final_id = free_node_id(graph, source_id);
        id_map.insert(source_id.clone(), final_id.clone());

        let mut node = node.clone();
        node.id = final_id.clone();
        node.generated_by_plan_node_id = Some(plan_node_id.to_string());
        node.plan_node_key = Some(source_id.clone());
        graph.nodes.insert(final_id.clone(), node);
        inserted.push(final_id);
    }

    // Deps were written against proposed ids; rewrite them through the map
    // and drop whatever no longer resolves.
    for final_id in &inserted {
        if let Some(node) = graph.nodes.get(final_id) {
            let rewritten: BTreeSet<String> = node
                .deps
                .iter()
                .filter_map(|dep| id_map.get(dep).cloned().or_else(|| {
                    graph.nodes.contains_key(dep).then(|| dep.clone())
                }))
                .filter(|dep| dep != final_id)
                .collect();
            if let Some(node) = graph.nodes.get_mut(final_id) {
                node.deps = rewritten;
            }
        }
    }

    let mut edge_keys: BTreeSet<(String, String, EdgeType, EdgeCondition)> =
        graph.edges.iter().map(Edge::key).collect();
    for edge in &proposed.edges {
        let Some(from) = resolve_endpoint(graph, &id_map, &edge.from) else {
            continue;
        };
        let Some(to) = resolve_endpoint(graph, &id_map, &edge.to) else {
            continue;
        };
        let mapped = Edge {
            from,
            to,
            edge_type: edge.edge_type,
            condition: edge.condition,
        };
        if edge_keys.insert(mapped.key()) {
            graph.edges.push(mapped);
        }
    }

    if graph.nodes.contains_key(anchor_id) {
        for final_id in &inserted {
            let anchor_edge = Edge::hard(anchor_id, final_id.clone());
            if edge_keys.insert(anchor_edge.key()) {
                graph.edges.push(anchor_edge);
            }
            if let Some(node) = graph.nodes.get_mut(final_id) {
                node.deps.insert(anchor_id.to_string());
            }
        }
    }

    let inserted_set: BTreeSet<&String> = inserted.iter().collect();
    let draft_sink_node_ids: Vec<String> = inserted
        .iter()
        .filter(|id| {
            !graph
                .outgoing_edges(id)
                .any(|edge| inserted_set.contains(&edge.to))
        })
        .cloned()
        .collect();

    let mut sinks: Vec<String> = graph
        .done_criteria
        .completion_sink_node_ids
        .iter()
        .filter(|sink| {
            sink.as_str() != anchor_id
                && !previous.contains(*sink)
                && graph.nodes.contains_key(*sink)
        })
        .cloned()
        .collect();
    for sink in &draft_sink_node_ids {
        if !sinks.contains(sink) {
            sinks.push(sink.clone());
        }
    }
    graph.done_criteria.completion_sink_node_ids = sinks;

    PlanReplacement {
        draft_node_ids: inserted,
        draft_sink_node_ids,
        id_map,
    }
}

fn resolve_endpoint(
    graph: &Graph,
    id_map: &BTreeMap<String, String>,
    raw: &str,
) -> Option<String> {
    id_map
        .get(raw)
        .cloned()
        .or_else(|| graph.nodes.contains_key(raw).then(|| raw.to_string()))
}

/// Collision renaming: `base`, then `draft-<base>`, then `<base>-2`, …
fn free_node_id(graph: &Graph, base: &str) -> String {
    if !graph.nodes.contains_key(base) {
        return base.to_string();
    }
    let drafted = format!("draft-{base}");
    if !graph.nodes.contains_key(&drafted) {
        return drafted;
    }
    let mut counter = 2u32;
    loop {
        let candidate = format!("{base}-{counter}");
        if !graph.nodes.contains_key(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
