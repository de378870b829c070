//! Validation of a proposed plan before it replaces the planned subtree.

use crate::model::{GateType, Graph, Node, NodeType};
use crate::plan::merge::canonical_node_spec;
use crate::plan::parse::ProposedGraph;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

fn pattern(cell: &'static OnceLock<Regex>, source: &'static str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(source).expect("static pattern should compile"))
}

fn ui_ux_task() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\b(ui|ux|user (interface|experience))\b")
}

fn architecture_task() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\barchitect")
}

fn ui_coverage() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\b(ui|interface|screen|component|view|layout)\b")
}

fn ux_state_coverage() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\b(ux|loading|empty|error|state|states)\b")
}

fn backend_touchpoint() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\b(backend|api|server|service|endpoint)\b")
}

fn frontend_touchpoint() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\b(frontend|ui|client|web|page)\b")
}

fn data_touchpoint() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    pattern(&CELL, r"(?i)\b(data|database|storage|schema|db|migration)\b")
}

const MIN_ARCHITECTURE_WORK_NODES: usize = 5;

/// Validate a proposed plan. An empty result means the plan is acceptable;
/// otherwise each entry is a human-readable reason suitable for appending to
/// a retry prompt.
pub fn validate_plan(
    proposed: &ProposedGraph,
    task_text: &str,
    graph: &Graph,
    locked: &BTreeSet<String>,
    anchor_id: &str,
) -> Vec<String> {
    let mut reasons = Vec::new();

    for (id, node) in &proposed.nodes {
        if node.node_type != NodeType::Work {
            continue;
        }
        for (label, empty) in [
            ("where", node.where_.is_empty()),
            ("whatChanges", node.what_changes.is_empty()),
            ("acceptanceCriteria", node.acceptance_criteria.is_empty()),
            ("todos", node.todos.is_empty()),
            ("checks", node.verification.is_empty()),
        ] {
            if empty {
                reasons.push(format!("work node '{id}' has an empty {label} list"));
            }
        }
    }

    let has_gate = |wanted: GateType| {
        proposed
            .nodes
            .values()
            .any(|node| node.node_type == NodeType::Gate && node.gate_type == Some(wanted.clone()))
    };
    if !has_gate(GateType::QualityGate) {
        reasons.push("plan must include at least one quality_gate".to_string());
    }
    if !has_gate(GateType::HandoffGate) {
        reasons.push("plan must include at least one handoff_gate".to_string());
    }

    if ui_ux_task().is_match(task_text) {
        let all_text = combined_text(proposed);
        if !ui_coverage().is_match(&all_text) {
            reasons.push("task is UI/UX scoped but no node covers interface work".to_string());
        }
        if !ux_state_coverage().is_match(&all_text) {
            reasons.push(
                "task is UI/UX scoped but no node covers UX states (loading/empty/error)"
                    .to_string(),
            );
        }
    }

    if architecture_task().is_match(task_text) {
        let work_nodes = proposed
            .nodes
            .values()
            .filter(|node| node.node_type == NodeType::Work)
            .count();
        if work_nodes < MIN_ARCHITECTURE_WORK_NODES {
            reasons.push(format!(
                "architecture task needs at least {MIN_ARCHITECTURE_WORK_NODES} work nodes, plan has {work_nodes}"
            ));
        }
        let all_text = combined_text(proposed);
        for (touchpoint, matcher) in [
            ("backend", backend_touchpoint()),
            ("frontend", frontend_touchpoint()),
            ("data", data_touchpoint()),
        ] {
            if !matcher.is_match(&all_text) {
                reasons.push(format!(
                    "architecture task plan is missing a {touchpoint} touchpoint"
                ));
            }
        }
    }

    for (id, node) in &proposed.nodes {
        if !locked.contains(id) {
            continue;
        }
        let Some(existing) = graph.nodes.get(id) else {
            continue;
        };
        if canonical_node_spec(node, anchor_id) != canonical_node_spec(existing, anchor_id) {
            reasons.push(format!(
                "proposed node '{id}' restructures a locked completed node"
            ));
        }
    }

    reasons
}

fn combined_text(proposed: &ProposedGraph) -> String {
    let mut text = String::new();
    for node in proposed.nodes.values() {
        push_node_text(&mut text, node);
    }
    text
}

fn push_node_text(text: &mut String, node: &Node) {
    for part in [node.title.as_deref(), node.description.as_deref()] {
        if let Some(part) = part {
            text.push_str(part);
            text.push('\n');
        }
    }
    for list in [
        &node.where_,
        &node.what_changes,
        &node.acceptance_criteria,
        &node.todos,
        &node.verification,
    ] {
        for entry in list {
            text.push_str(entry);
            text.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeStatus, VerificationStrategy};
    use crate::plan::PLAN_APPROVAL_ANCHOR;
    use std::collections::BTreeMap;

    fn complete_work(id: &str, topic: &str) -> Node {
        let mut node = Node::new(id, NodeType::Work);
        node.title = Some(format!("Build {topic}"));
        node.where_ = vec![format!("src/{topic}.rs")];
        node.what_changes = vec![format!("implement {topic}")];
        node.acceptance_criteria = vec![format!("{topic} works")];
        node.todos = vec![format!("write {topic}")];
        node.verification = vec!["cargo test".to_string()];
        node
    }

    fn gate(id: &str, gate_type: GateType) -> Node {
        let mut node = Node::new(id, NodeType::Gate);
        node.gate_type = Some(gate_type);
        node.verification_strategy = Some(VerificationStrategy::default());
        node
    }

    fn acceptable_plan() -> ProposedGraph {
        let mut nodes = BTreeMap::new();
        nodes.insert("build".to_string(), complete_work("build", "parser"));
        nodes.insert("quality".to_string(), gate("quality", GateType::QualityGate));
        nodes.insert("handoff".to_string(), gate("handoff", GateType::HandoffGate));
        ProposedGraph {
            nodes,
            edges: Vec::new(),
        }
    }

    #[test]
    fn validate_plan_complete_expected_no_reasons() {
        let reasons = validate_plan(
            &acceptable_plan(),
            "implement the parser",
            &Graph::new("g1"),
            &BTreeSet::new(),
            PLAN_APPROVAL_ANCHOR,
        );
        assert!(reasons.is_empty(), "unexpected reasons: {reasons:?}");
    }

    #[test]
    fn validate_plan_empty_work_lists_expected_reasons_per_list() {
        let mut plan = acceptable_plan();
        plan.nodes
            .insert("bare".to_string(), Node::new("bare", NodeType::Work));

        let reasons = validate_plan(
            &plan,
            "implement the parser",
            &Graph::new("g1"),
            &BTreeSet::new(),
            PLAN_APPROVAL_ANCHOR,
        );
        assert_eq!(
            reasons
                .iter()
                .filter(|reason| reason.contains("'bare'"))
                .count(),
            5
        );
    }

    #[test]
    fn validate_plan_missing_gates_expected_reasons() {
        let mut plan = acceptable_plan();
        plan.nodes.remove("quality");
        plan.nodes.remove("handoff");

        let reasons = validate_plan(
            &plan,
            "implement the parser",
            &Graph::new("g1"),
            &BTreeSet::new(),
            PLAN_APPROVAL_ANCHOR,
        );
        assert!(reasons.iter().any(|reason| reason.contains("quality_gate")));
        assert!(reasons.iter().any(|reason| reason.contains("handoff_gate")));
    }

    #[test]
    fn validate_plan_ui_task_without_state_coverage_expected_reason() {
        let mut plan = acceptable_plan();
        for node in plan.nodes.values_mut() {
            node.title = Some("backend pass".to_string());
            node.where_ = vec!["src/api.rs".to_string()];
            node.what_changes = vec!["rework api".to_string()];
            node.acceptance_criteria = vec!["api responds".to_string()];
            node.todos = vec!["rework api".to_string()];
            node.verification = vec!["cargo test".to_string()];
        }

        let reasons = validate_plan(
            &plan,
            "redesign the settings UI",
            &Graph::new("g1"),
            &BTreeSet::new(),
            PLAN_APPROVAL_ANCHOR,
        );
        assert!(reasons.iter().any(|reason| reason.contains("interface work")));
        assert!(reasons.iter().any(|reason| reason.contains("UX states")));
    }

    #[test]
    fn validate_plan_architecture_task_expected_size_and_touchpoints() {
        let reasons = validate_plan(
            &acceptable_plan(),
            "rework the system architecture",
            &Graph::new("g1"),
            &BTreeSet::new(),
            PLAN_APPROVAL_ANCHOR,
        );
        assert!(reasons.iter().any(|reason| reason.contains("at least 5 work nodes")));
    }

    #[test]
    fn validate_plan_architecture_task_with_touchpoints_expected_clean() {
        let mut nodes = BTreeMap::new();
        for (id, topic) in [
            ("api", "backend api endpoint"),
            ("web", "frontend client page"),
            ("schema", "database schema migration"),
            ("glue", "service integration"),
            ("docs", "architecture notes"),
        ] {
            nodes.insert(id.to_string(), complete_work(id, topic));
        }
        nodes.insert("quality".to_string(), gate("quality", GateType::QualityGate));
        nodes.insert("handoff".to_string(), gate("handoff", GateType::HandoffGate));
        let plan = ProposedGraph {
            nodes,
            edges: Vec::new(),
        };

        let reasons = validate_plan(
            &plan,
            "rework the system architecture",
            &Graph::new("g1"),
            &BTreeSet::new(),
            PLAN_APPROVAL_ANCHOR,
        );
        assert!(reasons.is_empty(), "unexpected reasons: {reasons:?}");
    }

    #[test]
    fn validate_plan_altered_locked_node_expected_reason() {
        let mut graph = Graph::new("g1");
        let mut locked_node = complete_work("backend", "api");
        locked_node.status = NodeStatus::Done;
        graph.nodes.insert("backend".to_string(), locked_node);

        let mut plan = acceptable_plan();
        let mut altered = complete_work("backend", "api");
        altered.acceptance_criteria = vec!["something else entirely".to_string()];
        plan.nodes.insert("backend".to_string(), altered);

        let locked = BTreeSet::from(["backend".to_string()]);
        let reasons = validate_plan(
            &plan,
            "implement the api",
            &graph,
            &locked,
            PLAN_APPROVAL_ANCHOR,
        );
        assert!(reasons.iter().any(|reason| reason.contains("locked")));
    }

    #[test]
    fn validate_plan_identical_locked_node_expected_clean() {
        let mut graph = Graph::new("g1");
        let mut locked_node = complete_work("backend", "api");
        locked_node.status = NodeStatus::Done;
        locked_node.attempts = 3;
        graph.nodes.insert("backend".to_string(), locked_node);

        let mut plan = acceptable_plan();
        plan.nodes
            .insert("backend".to_string(), complete_work("backend", "api"));

        let locked = BTreeSet::from(["backend".to_string()]);
        let reasons = validate_plan(
            &plan,
            "implement the api",
            &graph,
            &locked,
            PLAN_APPROVAL_ANCHOR,
        );
        assert!(reasons.is_empty(), "unexpected reasons: {reasons:?}");
    }
}
