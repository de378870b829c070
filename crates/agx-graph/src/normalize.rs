//! Ingest normalization and shape assertions.
//!
//! Graphs arrive from the cloud, from task embeds, and from planner output;
//! all of them pass through `normalize` before the scheduler sees them.
//! Normalization is idempotent.

use crate::errors::{GraphError, GraphResult};
use crate::model::{DEFAULT_MAX_ATTEMPTS, DEFAULT_MODE, Graph, NodeType};
use serde_json::Value;

/// Assert the raw payload has the load-bearing graph shape before any typed
/// parse: an `id`, an object `nodes` map, and (when present) an array of
/// `edges`. Violations are fatal at load.
pub fn assert_shape_value(value: &Value) -> GraphResult<()> {
    let Some(object) = value.as_object() else {
        return Err(GraphError::InvalidShape(
            "graph payload is not an object".to_string(),
        ));
    };
    match object.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => {}
        _ => {
            return Err(GraphError::InvalidShape(
                "graph is missing a non-empty id".to_string(),
            ));
        }
    }
    match object.get("nodes") {
        Some(nodes) if nodes.is_object() => {}
        Some(_) => {
            return Err(GraphError::InvalidShape(
                "graph nodes must be an object keyed by node id".to_string(),
            ));
        }
        None => {
            return Err(GraphError::InvalidShape(
                "graph is missing its nodes object".to_string(),
            ));
        }
    }
    if let Some(edges) = object.get("edges") {
        if !edges.is_array() && !edges.is_null() {
            return Err(GraphError::InvalidShape(
                "graph edges must be an array".to_string(),
            ));
        }
    }
    Ok(())
}

/// Typed counterpart of [`assert_shape_value`], for graphs re-checked after
/// mutation.
pub fn assert_shape(graph: &Graph) -> GraphResult<()> {
    if graph.id.trim().is_empty() {
        return Err(GraphError::InvalidShape(
            "graph is missing a non-empty id".to_string(),
        ));
    }
    Ok(())
}

/// Shape-check, deserialize, and normalize a raw graph payload.
pub fn graph_from_value(value: &Value) -> GraphResult<Graph> {
    assert_shape_value(value)?;
    let mut graph: Graph = serde_json::from_value(value.clone())
        .map_err(|err| GraphError::Serialization(err.to_string()))?;
    normalize(&mut graph);
    Ok(graph)
}

pub fn graph_to_value(graph: &Graph) -> GraphResult<Value> {
    serde_json::to_value(graph).map_err(|err| GraphError::Serialization(err.to_string()))
}

/// Normalize a graph in place.
///
/// Vocabulary case folding happens at deserialization; this pass fixes the
/// structural leftovers: node ids mirrored from map keys, `spike` folded into
/// `work`, dep sets stripped of self and unknown references, dangling edges
/// dropped, stale completion sinks pruned, and version/policy floors applied.
pub fn normalize(graph: &mut Graph) {
    graph.id = graph.id.trim().to_string();
    if graph.mode.trim().is_empty() {
        graph.mode = DEFAULT_MODE.to_string();
    } else {
        graph.mode = graph.mode.trim().to_string();
    }
    if graph.graph_version == 0 {
        graph.graph_version = 1;
    }
    if graph.policy.max_concurrent == 0 {
        graph.policy.max_concurrent = crate::model::DEFAULT_MAX_CONCURRENT;
    }

    let known_ids: Vec<String> = graph.nodes.keys().cloned().collect();
    for (id, node) in graph.nodes.iter_mut() {
        node.id = id.clone();
        if node.node_type == NodeType::Other("spike".to_string()) {
            node.node_type = NodeType::Work;
            node.work_type.get_or_insert_with(|| "spike".to_string());
        }
        if node.max_attempts == 0 {
            node.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        node.deps
            .retain(|dep| dep != id && known_ids.iter().any(|known| known == dep));
    }

    graph.edges.retain(|edge| {
        known_ids.iter().any(|id| id == &edge.from) && known_ids.iter().any(|id| id == &edge.to)
    });

    let mut seen_sinks = std::collections::BTreeSet::new();
    let sink_ids = std::mem::take(&mut graph.done_criteria.completion_sink_node_ids);
    graph.done_criteria.completion_sink_node_ids = sink_ids
        .into_iter()
        .filter(|sink| {
            known_ids.iter().any(|id| id == sink) && seen_sinks.insert(sink.clone())
        })
        .collect();
}
