//! Cloud graph load and persist with optimistic concurrency.

use crate::backends::CloudTransport;
use crate::errors::{RuntimeError, RuntimeResult};
use agx_graph::{Graph, graph_from_value, graph_to_value};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub const GRAPH_LOAD_BASE_DELAY_MS: u64 = 250;
pub const GRAPH_LOAD_MAX_DELAY_MS: u64 = 2_000;

/// Fields the server may omit from a PATCH response but which the runtime is
/// authoritative for locally. A server `null` also yields to the local value.
const LOCALLY_AUTHORITATIVE_FIELDS: [&str; 5] = [
    "status",
    "startedAt",
    "completedAt",
    "timedOutAt",
    "runtimeEvents",
];

#[derive(Clone)]
pub struct GraphClient {
    transport: Arc<dyn CloudTransport>,
    load_retries: u32,
}

impl GraphClient {
    pub fn new(transport: Arc<dyn CloudTransport>, load_retries: u32) -> Self {
        Self {
            transport,
            load_retries: load_retries.max(1),
        }
    }

    fn endpoint(task_id: &str) -> String {
        format!("/api/tasks/{task_id}/graph")
    }

    /// GET the task graph with bounded retries and exponential backoff.
    /// Shape violations in a received payload are fatal immediately;
    /// transport failures retry until the budget runs out.
    pub async fn load(&self, task_id: &str) -> RuntimeResult<Graph> {
        let endpoint = Self::endpoint(task_id);
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=self.load_retries {
            match self.transport.request("GET", &endpoint, None).await {
                Ok(response) => match extract_graph_payload(&response) {
                    Some(payload) => return Ok(graph_from_value(payload)?),
                    None => {
                        last_error = "response did not contain a graph payload".to_string();
                    }
                },
                Err(err) => {
                    last_error = err.to_string();
                }
            }
            if attempt < self.load_retries {
                let delay = load_backoff_ms(attempt);
                tracing::debug!(attempt, delay_ms = delay, "graph load retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        Err(RuntimeError::GraphLoad(format!(
            "Failed to load graph for task {task_id} via GET {endpoint} after {} attempt(s): {last_error}",
            self.load_retries
        )))
    }

    /// PATCH the graph, trying the flat payload shape first and the wrapped
    /// shape second. The response becomes the new canonical graph with the
    /// locally-authoritative fields merge-preserved.
    pub async fn persist(&self, task_id: &str, graph: &Graph) -> RuntimeResult<Graph> {
        let endpoint = Self::endpoint(task_id);
        let local = graph_to_value(graph)?;
        let mut flat = json!({
            "graphId": graph.id,
            "mode": graph.mode,
            "nodes": local.get("nodes").cloned().unwrap_or_else(|| json!({})),
            "edges": local.get("edges").cloned().unwrap_or_else(|| json!([])),
            "policy": local.get("policy").cloned().unwrap_or_else(|| json!({})),
            "doneCriteria": local.get("doneCriteria").cloned().unwrap_or_else(|| json!({})),
        });
        flat["ifMatchGraphVersion"] = json!(graph.graph_version);
        let wrapped = json!({
            "graph": flat.clone(),
            "ifMatchGraphVersion": graph.graph_version,
        });

        let mut failures = Vec::new();
        for payload in [&flat, &wrapped] {
            match self.transport.request("PATCH", &endpoint, Some(payload)).await {
                Ok(response) => {
                    let merged = merge_preserve_local_fields(&response, &local)?;
                    return Ok(graph_from_value(&merged)?);
                }
                Err(err) => failures.push(err.to_string()),
            }
        }
        Err(RuntimeError::CloudPersist(format!(
            "PATCH {endpoint} rejected both payload shapes: {}",
            failures.join("; ")
        )))
    }
}

fn load_backoff_ms(attempt: u32) -> u64 {
    let power = 2u64.saturating_pow(attempt.saturating_sub(1));
    (GRAPH_LOAD_BASE_DELAY_MS.saturating_mul(power)).min(GRAPH_LOAD_MAX_DELAY_MS)
}

/// Find the graph object in a response that may wrap it under `graph`,
/// `execution_graph`, or `executionGraph`, or carry it at the root.
pub fn extract_graph_payload(value: &Value) -> Option<&Value> {
    for key in ["graph", "execution_graph", "executionGraph"] {
        if let Some(inner) = value.get(key) {
            if inner.is_object() {
                return Some(inner);
            }
        }
    }
    value.is_object().then_some(value)
}

fn merge_preserve_local_fields(response: &Value, local: &Value) -> RuntimeResult<Value> {
    let payload = extract_graph_payload(response).ok_or_else(|| {
        RuntimeError::CloudPersist("response did not contain a graph payload".to_string())
    })?;
    let mut merged = payload.clone();
    for field in LOCALLY_AUTHORITATIVE_FIELDS {
        let server_value = merged.get(field);
        if server_value.is_none() || server_value.is_some_and(Value::is_null) {
            if let Some(local_value) = local.get(field) {
                merged[field] = local_value.clone();
            }
        }
    }
    Ok(merged)
}
