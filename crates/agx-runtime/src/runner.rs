//! Top-level tick/dispatch/persist loop driving one task graph to a terminal
//! decision.

use crate::backends::{AgentRunner, CancellationWatcher, CloudTransport, abort_if_cancelled};
use crate::cloud::GraphClient;
use crate::config::LoopBudgets;
use crate::dispatch::Dispatcher;
use crate::errors::{RuntimeError, RuntimeResult};
use crate::events::{ExecEvent, ExecEventKind, ExecEventSink, LoopEvent, NodeEvent, PersistEvent};
use crate::gate::GateRunner;
use crate::task::{TaskSpec, resolve_approval_mode};
use agx_graph::{
    GateType, Graph, NodeStatus, NodeType, assert_shape, completion_sinks_satisfied,
    graph_from_value, graph_to_value, has_incomplete_nodes, is_terminal, status_fingerprint, tick,
};
use agx_store::{IndexEntry, LastRun, RunHandle, Stage, TaskStore, events, now_rfc3339};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Unproductive ticks tolerated before the loop declares a stall.
pub const STALL_TICK_LIMIT: u32 = 3;
const GC_KEEP_PER_STAGE: usize = 10;

pub const DECISION_DONE: &str = "done";
pub const DECISION_BLOCKED: &str = "blocked";
pub const DECISION_FAILED: &str = "failed";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Decision {
    pub done: bool,
    pub decision: String,
    pub explanation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph_version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_node_status: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_node_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl Decision {
    fn verdict(decision: &str, explanation: String) -> Self {
        Self {
            done: decision == DECISION_DONE,
            decision: decision.to_string(),
            explanation,
            ..Self::default()
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.decision == DECISION_DONE { 0 } else { 1 }
    }
}

#[derive(Clone)]
pub struct ExecutionConfig {
    pub provider: String,
    pub model: Option<String>,
    pub stage: Stage,
    /// Working directory verification gate checks run in.
    pub workspace_dir: PathBuf,
    pub agent: Arc<dyn AgentRunner>,
    pub gates: Arc<dyn GateRunner>,
    pub cloud: Arc<dyn CloudTransport>,
    pub cancellation: Arc<dyn CancellationWatcher>,
    pub events: ExecEventSink,
    pub budgets: LoopBudgets,
}

#[derive(Clone, Debug)]
pub struct ExecutionOutcome {
    pub code: i32,
    pub decision: Decision,
    pub last_run: LastRun,
    pub run_index_entry: IndexEntry,
}

struct EventEmitter {
    sink: ExecEventSink,
    sequence_no: u64,
}

impl EventEmitter {
    fn new(sink: ExecEventSink) -> Self {
        Self {
            sink,
            sequence_no: 0,
        }
    }

    fn emit(&mut self, kind: ExecEventKind) {
        if !self.sink.is_enabled() {
            return;
        }
        self.sequence_no += 1;
        self.sink.emit(ExecEvent {
            sequence_no: self.sequence_no,
            timestamp: now_rfc3339(),
            kind,
        });
    }
}

/// Drive one task to a terminal decision.
///
/// A run directory is opened before the loop starts and finalized exactly
/// once: with the decision on a clean return, or with a synthetic failed
/// decision when the loop errors out.
pub async fn run_task(
    store: &TaskStore,
    task_id: &str,
    task: &TaskSpec,
    config: ExecutionConfig,
) -> RuntimeResult<ExecutionOutcome> {
    let _lock = store.acquire_lock()?;
    store.init_task_state(task.objective())?;

    let mut run = match store.recover_incomplete_runs(&config.provider, config.model.as_deref())? {
        Some(recovery) => recovery,
        None => store.create_run(
            config.stage,
            &config.provider,
            config.model.as_deref(),
            None,
        )?,
    };
    let run_id = run.meta.run_id.clone();
    let run_stage = run.meta.stage;
    let mut emitter = EventEmitter::new(config.events.clone());

    match drive(store, task_id, task, &config, &mut run, &mut emitter).await {
        Ok(decision) => {
            emitter.emit(ExecEventKind::Loop(LoopEvent::Completed {
                run_id: run_id.clone(),
                decision: decision.decision.clone(),
            }));

            let task_status = decision.decision.clone();
            store.update_task_state(&json!({ "status": task_status }))?;
            let last_run =
                store.record_last_run(&run_id, run_stage.as_str(), Some(&decision.decision))?;
            let run_index_entry =
                store.upsert_index_entry(&task_status, task.title.as_deref())?;
            if let Err(err) = store.gc_runs(GC_KEEP_PER_STAGE, Some(&task_status)) {
                tracing::warn!(%err, "run gc failed");
            }

            Ok(ExecutionOutcome {
                code: decision.exit_code(),
                decision,
                last_run,
                run_index_entry,
            })
        }
        Err(err) => {
            emitter.emit(ExecEventKind::Loop(LoopEvent::Failed {
                run_id: run_id.clone(),
                reason: err.to_string(),
            }));
            let _ = run.write_artifact("error.txt", err.to_string().as_bytes());
            if !run.is_finalized() {
                if let Err(fail_err) = run.fail(err.code(), &err.to_string()) {
                    tracing::warn!(%fail_err, "failed to close run after loop error");
                }
            }
            Err(err)
        }
    }
}

async fn drive(
    store: &TaskStore,
    task_id: &str,
    task: &TaskSpec,
    config: &ExecutionConfig,
    run: &mut RunHandle,
    emitter: &mut EventEmitter,
) -> RuntimeResult<Decision> {
    let budgets = config.budgets;
    let client = GraphClient::new(config.cloud.clone(), budgets.graph_load_retries);

    let context = json!({
        "task_id": task_id,
        "title": task.title,
        "stage": run.meta.stage.as_str(),
        "provider": config.provider,
        "model": config.model,
        "start_node_id": task.start_node_id,
    });
    let context_bytes = serde_json::to_vec_pretty(&context)
        .map_err(|err| RuntimeError::Serialization(err.to_string()))?;
    run.write_artifact("context.json", &context_bytes)?;

    let mut graph = match task.graph.as_ref() {
        Some(embedded) => graph_from_value(embedded)?,
        None => client.load(task_id).await?,
    };
    assert_shape(&graph)?;
    if graph.started_at.is_none() {
        graph.started_at = Some(now_rfc3339());
    }
    emitter.emit(ExecEventKind::Loop(LoopEvent::Started {
        run_id: run.meta.run_id.clone(),
        graph_id: graph.id.clone(),
    }));
    run.write_prompt(task.objective())?;

    let approval_mode = resolve_approval_mode(task);
    let active_start = resolve_start_node(&mut graph, task);
    let allowed: Option<BTreeSet<String>> =
        active_start.as_ref().map(|id| BTreeSet::from([id.clone()]));

    graph = persist_graph(store, &client, task_id, graph, emitter).await?;

    let dispatcher = Dispatcher {
        task_id: task_id.to_string(),
        task: task.clone(),
        provider: config.provider.clone(),
        model: config.model.clone(),
        approval_mode,
        workspace_dir: config.workspace_dir.clone(),
        agent: config.agent.clone(),
        gates: config.gates.clone(),
    };

    let mut stalled_ticks = 0u32;
    let mut fingerprint = status_fingerprint(&graph);

    for _ in 0..budgets.max_ticks {
        abort_if_cancelled(config.cancellation.as_ref())?;

        let outcome = tick(&graph, allowed.as_ref(), &now_rfc3339());
        graph = outcome.graph;
        for event in &outcome.events {
            emitter.emit(ExecEventKind::Node(NodeEvent::Promoted {
                node_id: event.node_id.clone(),
                from_status: event.from_status.clone(),
                to_status: event.to_status.clone(),
            }));
        }
        if !outcome.events.is_empty() {
            graph = persist_graph(store, &client, task_id, graph, emitter).await?;
        }

        let running: Vec<String> = graph
            .nodes
            .iter()
            .filter(|(_, node)| node.status == NodeStatus::Running)
            .map(|(id, _)| id.clone())
            .collect();
        let progressed = !running.is_empty();
        for node_id in &running {
            run.append_event(events::engine_call_started(
                &config.provider,
                config.model.as_deref(),
            ))?;
            let dispatched = dispatcher.dispatch(&mut graph, node_id).await?;
            run.append_event(events::engine_call_completed(
                &config.provider,
                dispatched.status.as_str(),
            ))?;
            emitter.emit(ExecEventKind::Node(NodeEvent::Dispatched {
                node_id: dispatched.node_id,
                status: dispatched.status.to_string(),
            }));
        }
        if progressed {
            graph = persist_graph(store, &client, task_id, graph, emitter).await?;
        }

        if let Some(start_id) = active_start.as_ref() {
            if let Some(node) = graph.nodes.get(start_id) {
                if is_terminal(&node.status) {
                    let succeeded = matches!(
                        node.status,
                        NodeStatus::Done | NodeStatus::Passed | NodeStatus::Skipped
                    );
                    let mut decision = if succeeded {
                        let mut decision = Decision::verdict(
                            DECISION_DONE,
                            format!("start node '{start_id}' completed"),
                        );
                        decision.next_prompt = Some("No further action needed.".to_string());
                        decision
                    } else {
                        let mut decision = Decision::verdict(
                            DECISION_FAILED,
                            format!("start node '{start_id}' ended as {}", node.status),
                        );
                        decision.next_prompt = Some(
                            "Inspect the start node's error and re-run the task.".to_string(),
                        );
                        decision
                    };
                    decision.start_node_id = Some(start_id.clone());
                    decision.start_node_status = Some(node.status.to_string());
                    return finalize_with(run, &graph, decision);
                }
            }
        }

        let current_fingerprint = status_fingerprint(&graph);
        if !progressed && outcome.events.is_empty() && current_fingerprint == fingerprint {
            stalled_ticks += 1;
        } else {
            stalled_ticks = 0;
        }
        fingerprint = current_fingerprint;

        if !has_incomplete_nodes(&graph) {
            let succeeded = completion_sinks_satisfied(&graph);
            graph.status = Some(
                if succeeded { DECISION_DONE } else { DECISION_FAILED }.to_string(),
            );
            graph.completed_at = Some(now_rfc3339());
            graph = persist_graph(store, &client, task_id, graph, emitter).await?;

            let decision = if succeeded {
                let mut decision = Decision::verdict(
                    DECISION_DONE,
                    "every completion sink reached a successful status".to_string(),
                );
                decision.final_result = Some(sink_summary(&graph));
                decision.next_prompt = Some("No further action needed.".to_string());
                decision
            } else {
                let failed: Vec<String> = graph
                    .nodes
                    .values()
                    .filter(|node| node.status == NodeStatus::Failed)
                    .map(|node| node.id.clone())
                    .collect();
                let mut decision = Decision::verdict(
                    DECISION_FAILED,
                    format!("graph completed with failed node(s): {}", failed.join(", ")),
                );
                decision.blocked_node_ids = failed;
                decision.next_prompt =
                    Some("Inspect the failed nodes' errors and re-run the task.".to_string());
                decision
            };
            return finalize_with(run, &graph, decision);
        }

        let awaiting: Vec<String> = graph
            .nodes
            .values()
            .filter(|node| node.status == NodeStatus::AwaitingHuman)
            .map(|node| node.id.clone())
            .collect();
        if !awaiting.is_empty() {
            let mut decision = Decision::verdict(
                DECISION_BLOCKED,
                format!(
                    "gate {} requires human verification",
                    awaiting.join(", ")
                ),
            );
            decision.blocked_node_ids = awaiting;
            decision.next_prompt =
                Some("Review the awaiting gate(s), then re-run the task.".to_string());
            return finalize_with(run, &graph, decision);
        }

        if stalled_ticks >= STALL_TICK_LIMIT {
            let blockers: Vec<String> = graph
                .nodes
                .values()
                .filter(|node| {
                    matches!(
                        node.status,
                        NodeStatus::Pending | NodeStatus::Blocked | NodeStatus::AwaitingHuman
                    )
                })
                .map(|node| node.id.clone())
                .collect();
            let mut decision = Decision::verdict(
                DECISION_BLOCKED,
                format!(
                    "no progress for {STALL_TICK_LIMIT} ticks; blocked on: {}",
                    blockers.join(", ")
                ),
            );
            decision.blocked_node_ids = blockers;
            decision.next_prompt =
                Some("Unblock the listed nodes, then re-run the task.".to_string());
            return finalize_with(run, &graph, decision);
        }
    }

    let mut decision = Decision::verdict(
        DECISION_FAILED,
        format!(
            "tick cap of {} exceeded before the graph completed",
            budgets.max_ticks
        ),
    );
    decision.error_code = Some("E_TICK_CAP".to_string());
    decision.next_prompt = Some("Raise AGX_V2_MAX_TICKS or simplify the graph.".to_string());
    finalize_with(run, &graph, decision)
}

async fn persist_graph(
    store: &TaskStore,
    client: &GraphClient,
    task_id: &str,
    graph: Graph,
    emitter: &mut EventEmitter,
) -> RuntimeResult<Graph> {
    store.write_task_graph(&graph_to_value(&graph)?)?;
    let updated = client.persist(task_id, &graph).await?;
    assert_shape(&updated)?;
    store.write_task_graph(&graph_to_value(&updated)?)?;
    emitter.emit(ExecEventKind::Persist(PersistEvent::Saved {
        graph_version: updated.graph_version,
    }));
    Ok(updated)
}

fn finalize_with(
    run: &mut RunHandle,
    graph: &Graph,
    mut decision: Decision,
) -> RuntimeResult<Decision> {
    decision.graph_id = Some(graph.id.clone());
    decision.graph_version = Some(graph.graph_version);
    run.write_output(&decision.explanation)?;
    let value = serde_json::to_value(&decision)
        .map_err(|err| RuntimeError::Serialization(err.to_string()))?;
    run.finalize(&value)?;
    Ok(decision)
}

fn sink_summary(graph: &Graph) -> String {
    let done = graph
        .nodes
        .values()
        .filter(|node| matches!(node.status, NodeStatus::Done | NodeStatus::Passed))
        .count();
    format!("{done} of {} node(s) completed successfully", graph.nodes.len())
}

/// Resolve a single-node rerun request. A work-type start node that already
/// reached a settled status is reset to pending, and every approval gate
/// downstream of it is reset so the rerun re-earns its approvals. Gate-type
/// start nodes are left as they are.
fn resolve_start_node(graph: &mut Graph, task: &TaskSpec) -> Option<String> {
    let start_id = task.start_node_id.clone()?;
    if !graph.nodes.contains_key(&start_id) {
        tracing::warn!(%start_id, "task start node not present in graph; ignoring");
        return None;
    }

    let needs_reset = graph.nodes.get(&start_id).is_some_and(|node| {
        node.node_type == NodeType::Work
            && matches!(
                node.status,
                NodeStatus::Done
                    | NodeStatus::Passed
                    | NodeStatus::Failed
                    | NodeStatus::Skipped
                    | NodeStatus::AwaitingHuman
                    | NodeStatus::Blocked
            )
    });
    if !needs_reset {
        return Some(start_id);
    }

    let downstream = forward_reachable(graph, &start_id);
    if let Some(node) = graph.nodes.get_mut(&start_id) {
        node.status = NodeStatus::Pending;
        node.output = None;
        node.completed_at = None;
        node.started_at = None;
        node.error = None;
        node.attempts = 0;
    }
    for id in downstream {
        if let Some(node) = graph.nodes.get_mut(&id) {
            if node.node_type == NodeType::Gate
                && node.gate_type == Some(GateType::ApprovalGate)
            {
                node.status = NodeStatus::Pending;
                node.verification_result = None;
                node.completed_at = None;
            }
        }
    }
    Some(start_id)
}

/// Forward traversal over both declared edges and dep back-references.
fn forward_reachable(graph: &Graph, root: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut frontier = vec![root.to_string()];
    while let Some(current) = frontier.pop() {
        let mut children: BTreeSet<String> = graph
            .outgoing_edges(&current)
            .map(|edge| edge.to.clone())
            .collect();
        for node in graph.nodes.values() {
            if node.deps.contains(&current) {
                children.insert(node.id.clone());
            }
        }
        for child in children {
            if child != root && seen.insert(child.clone()) {
                frontier.push(child);
            }
        }
    }
    seen
}
