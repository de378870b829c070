//! Per-node execution: plan nodes re-plan the graph, work nodes go to the
//! agent engine, gates verify, and structural nodes route.

use crate::backends::{AgentRunner, PlanRequest, WorkRequest};
use crate::errors::{RuntimeError, RuntimeResult};
use crate::gate::{GateRunner, gate_status_from_verdict};
use crate::prompts::{
    append_validation_reasons, build_plan_prompt, build_work_prompt, truncate_summary,
};
use crate::task::{ApprovalMode, TaskSpec};
use agx_graph::{
    GateType, Graph, Node, NodeOutput, NodeStatus, NodeType, PLAN_APPROVAL_ANCHOR, StrategyType,
    VerificationResult, is_plan_node, locked_node_ids, parse_plan_output, previous_draft_node_ids,
    replace_planned_subtree, validate_plan,
};
use agx_store::{millis_since, now_rfc3339};
use serde_json::json;
use std::sync::Arc;

pub const VERIFIED_BY_AUTO_APPROVAL: &str = "auto_approval";
pub const VERIFIED_BY_HUMAN: &str = "human";
pub const VERIFIED_BY_AUTO: &str = "auto";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeKind {
    Plan,
    Work,
    Gate,
    Structural,
}

fn classify(node: &Node) -> NodeKind {
    if is_plan_node(node) {
        return NodeKind::Plan;
    }
    match node.node_type {
        NodeType::Work => NodeKind::Work,
        NodeType::Gate => NodeKind::Gate,
        _ => NodeKind::Structural,
    }
}

pub struct Dispatcher {
    pub task_id: String,
    pub task: TaskSpec,
    pub provider: String,
    pub model: Option<String>,
    pub approval_mode: ApprovalMode,
    pub workspace_dir: std::path::PathBuf,
    pub agent: Arc<dyn AgentRunner>,
    pub gates: Arc<dyn GateRunner>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DispatchOutcome {
    pub node_id: String,
    pub status: NodeStatus,
    /// How many planner attempts ran, zero for non-plan nodes.
    pub plan_attempts: u32,
}

impl Dispatcher {
    /// Execute one node currently in `running` and apply its result to the
    /// graph.
    pub async fn dispatch(
        &self,
        graph: &mut Graph,
        node_id: &str,
    ) -> RuntimeResult<DispatchOutcome> {
        let Some(snapshot) = graph.nodes.get(node_id).cloned() else {
            return Err(RuntimeError::Dispatch(format!(
                "dispatch reached unknown node '{node_id}'"
            )));
        };

        let mut plan_attempts = 0;
        match classify(&snapshot) {
            NodeKind::Plan => plan_attempts = self.run_plan_node(graph, &snapshot).await?,
            NodeKind::Work => self.run_work_node(graph, &snapshot).await?,
            NodeKind::Gate => self.run_gate_node(graph, &snapshot).await?,
            NodeKind::Structural => {
                if let Some(node) = graph.nodes.get_mut(node_id) {
                    node.status = NodeStatus::Done;
                }
            }
        }

        finish_terminal_node(graph, node_id);
        let status = graph
            .nodes
            .get(node_id)
            .map(|node| node.status.clone())
            .unwrap_or(NodeStatus::Other("removed".to_string()));
        Ok(DispatchOutcome {
            node_id: node_id.to_string(),
            status,
            plan_attempts,
        })
    }

    async fn run_work_node(&self, graph: &mut Graph, snapshot: &Node) -> RuntimeResult<()> {
        let prompt = build_work_prompt(&self.task, snapshot);
        let request = WorkRequest {
            task_id: self.task_id.clone(),
            node_id: snapshot.id.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            prompt,
        };
        match self.agent.run_work(request).await {
            Ok(summary) => {
                if let Some(node) = graph.nodes.get_mut(&snapshot.id) {
                    node.status = NodeStatus::Done;
                    node.error = None;
                    let output = node.output.get_or_insert_with(NodeOutput::default);
                    output.summary = Some(truncate_summary(&summary));
                    output.completed_at = Some(now_rfc3339());
                }
                Ok(())
            }
            Err(err) => {
                apply_attempt_failure(graph, &snapshot.id, &err.to_string());
                Ok(())
            }
        }
    }

    async fn run_plan_node(&self, graph: &mut Graph, snapshot: &Node) -> RuntimeResult<u32> {
        let previous = previous_draft_node_ids(graph, &snapshot.id, PLAN_APPROVAL_ANCHOR);
        let locked = locked_node_ids(graph, &previous);
        let base_prompt = build_plan_prompt(&self.task, graph, &previous, &locked);
        let task_text = self.task.objective().to_string();

        let mut prompt = base_prompt.clone();
        let mut attempts_used = 0u32;
        let mut last_reasons: Vec<String> = Vec::new();
        for _ in 0..2 {
            attempts_used += 1;
            let request = PlanRequest {
                task_id: self.task_id.clone(),
                node_id: snapshot.id.clone(),
                provider: self.provider.clone(),
                model: self.model.clone(),
                prompt: prompt.clone(),
            };
            let raw = match self.agent.run_plan(request).await {
                Ok(raw) => raw,
                Err(err) => {
                    apply_attempt_failure(graph, &snapshot.id, &err.to_string());
                    return Ok(attempts_used);
                }
            };

            let Some(proposed) = parse_plan_output(&raw) else {
                last_reasons = vec!["planner output was not a parsable JSON graph".to_string()];
                prompt = append_validation_reasons(&base_prompt, &last_reasons);
                continue;
            };
            let reasons =
                validate_plan(&proposed, &task_text, graph, &locked, PLAN_APPROVAL_ANCHOR);
            if !reasons.is_empty() {
                last_reasons = reasons;
                prompt = append_validation_reasons(&base_prompt, &last_reasons);
                continue;
            }

            let replacement = replace_planned_subtree(
                graph,
                &snapshot.id,
                PLAN_APPROVAL_ANCHOR,
                &proposed,
            );
            if let Some(node) = graph.nodes.get_mut(&snapshot.id) {
                node.status = NodeStatus::Done;
                node.error = None;
                node.output = Some(NodeOutput {
                    summary: Some(format!(
                        "planned {} node(s)",
                        replacement.draft_node_ids.len()
                    )),
                    completed_at: Some(now_rfc3339()),
                    proposed_graph: serde_json::to_value(&proposed).ok(),
                    draft_node_ids: replacement.draft_node_ids.clone(),
                    draft_sink_node_ids: replacement.draft_sink_node_ids.clone(),
                });
            }
            for node in graph.nodes.values_mut() {
                if node.node_type == NodeType::Root && node.graph_created == Some(false) {
                    node.graph_created = Some(true);
                }
            }
            return Ok(attempts_used);
        }

        let detail = if last_reasons.is_empty() {
            "planner produced no acceptable plan".to_string()
        } else {
            format!("plan rejected: {}", last_reasons.join("; "))
        };
        apply_attempt_failure(graph, &snapshot.id, &detail);
        Ok(attempts_used)
    }

    async fn run_gate_node(&self, graph: &mut Graph, snapshot: &Node) -> RuntimeResult<()> {
        let gate_type = snapshot.gate_type.clone().unwrap_or_default();
        let now = now_rfc3339();

        if self.approval_mode == ApprovalMode::Auto && gate_type == GateType::ApprovalGate {
            if let Some(node) = graph.nodes.get_mut(&snapshot.id) {
                node.status = NodeStatus::Passed;
                node.verification_result = Some(VerificationResult {
                    passed: true,
                    checks: None,
                    verified_at: Some(now),
                    verified_by: Some(VERIFIED_BY_AUTO_APPROVAL.to_string()),
                });
            }
            return Ok(());
        }

        if snapshot.strategy_kind() == StrategyType::Human {
            if let Some(node) = graph.nodes.get_mut(&snapshot.id) {
                node.status = NodeStatus::AwaitingHuman;
                node.verification_result = Some(VerificationResult {
                    passed: false,
                    checks: None,
                    verified_at: Some(now),
                    verified_by: Some(VERIFIED_BY_HUMAN.to_string()),
                });
            }
            return Ok(());
        }

        let checks = snapshot
            .verification_strategy
            .as_ref()
            .map(|strategy| strategy.checks.clone())
            .unwrap_or_default();
        let verdict = self
            .gates
            .run(&checks, self.workspace_dir.as_path(), snapshot.verify_failures)
            .await?;
        let status = gate_status_from_verdict(&verdict);
        if let Some(node) = graph.nodes.get_mut(&snapshot.id) {
            node.verify_failures = verdict.verify_failures;
            node.status = status;
            node.verification_result = Some(VerificationResult {
                passed: verdict.passed && !verdict.force_action,
                checks: Some(json!(verdict.results)),
                verified_at: Some(now),
                verified_by: Some(VERIFIED_BY_AUTO.to_string()),
            });
            if node.status == NodeStatus::Failed {
                node.error = verdict
                    .reason
                    .clone()
                    .or(Some("verification failed".to_string()));
            }
        }
        Ok(())
    }
}

/// Record one failed attempt: back to pending while budget remains, failed
/// with the error once exhausted.
fn apply_attempt_failure(graph: &mut Graph, node_id: &str, detail: &str) {
    let Some(node) = graph.nodes.get_mut(node_id) else {
        return;
    };
    node.attempts += 1;
    if node.attempts < node.max_attempts {
        node.status = NodeStatus::Pending;
        node.error = Some(detail.to_string());
    } else {
        node.status = NodeStatus::Failed;
        node.error = Some(detail.to_string());
        node.completed_at = Some(now_rfc3339());
    }
}

/// Terminal bookkeeping shared by every node kind: stamp `completedAt` once
/// and derive `actualMinutes` from the started stamp.
fn finish_terminal_node(graph: &mut Graph, node_id: &str) {
    let Some(node) = graph.nodes.get_mut(node_id) else {
        return;
    };
    if !matches!(
        node.status,
        NodeStatus::Done | NodeStatus::Passed | NodeStatus::Failed | NodeStatus::Skipped
    ) {
        return;
    }
    if node.completed_at.is_none() {
        node.completed_at = Some(now_rfc3339());
    }
    if node.actual_minutes.is_none() {
        if let Some(elapsed_ms) = node.started_at.as_deref().and_then(millis_since) {
            let minutes = ((elapsed_ms.max(0) as f64) / 60_000.0).round() as u64;
            node.actual_minutes = Some(minutes.max(1));
        }
    }
}
