//! Prompt builders for work and plan nodes.

use crate::task::TaskSpec;
use agx_graph::{Graph, Node};
use std::collections::BTreeSet;

/// Summaries stored on node output are capped at this many characters.
pub const MAX_SUMMARY_CHARS: usize = 8_000;
/// At most this many validation reasons are appended to a retry prompt.
pub const MAX_VALIDATION_REASONS: usize = 12;

fn push_section(prompt: &mut String, heading: &str, entries: &[String]) {
    if entries.is_empty() {
        return;
    }
    prompt.push_str(&format!("\n## {heading}\n"));
    for entry in entries {
        prompt.push_str(&format!("- {entry}\n"));
    }
}

/// Prompt for one work node: the task objective plus the node's scoping
/// lists.
pub fn build_work_prompt(task: &TaskSpec, node: &Node) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Objective\n");
    prompt.push_str(task.objective());
    prompt.push('\n');

    if let Some(title) = node.title.as_deref() {
        prompt.push_str(&format!("\n# Work item: {title}\n"));
    }
    if let Some(description) = node.description.as_deref() {
        prompt.push_str(description);
        prompt.push('\n');
    }

    push_section(&mut prompt, "Where", &node.where_);
    push_section(&mut prompt, "Planned Changes", &node.what_changes);
    push_section(&mut prompt, "Acceptance Criteria", &node.acceptance_criteria);
    push_section(&mut prompt, "To Dos", &node.todos);
    push_section(&mut prompt, "Validation Expectations", &node.verification);
    prompt
}

/// Prompt for the plan node. When re-scoping an existing plan, the prompt
/// carries a snapshot of the current plan nodes and the locked ids that must
/// come back unchanged.
pub fn build_plan_prompt(
    task: &TaskSpec,
    graph: &Graph,
    previous_drafts: &BTreeSet<String>,
    locked: &BTreeSet<String>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("# Objective\n");
    prompt.push_str(task.objective());
    prompt.push('\n');
    prompt.push_str(
        "\nProduce an execution plan as a JSON graph with a `nodes` object and an \
         `edges` array. Every work node needs non-empty `where`, `whatChanges`, \
         `acceptanceCriteria`, `todos`, and `verification` lists. Include at least \
         one quality_gate and one handoff_gate.\n",
    );

    if !previous_drafts.is_empty() {
        prompt.push_str("\n## Current plan\n");
        for id in previous_drafts {
            if let Some(node) = graph.nodes.get(id) {
                let title = node.title.as_deref().unwrap_or("(untitled)");
                prompt.push_str(&format!("- {id} [{}] {title}\n", node.status));
            }
        }
    }
    if !locked.is_empty() {
        prompt.push_str(
            "\n## Locked nodes\nThese nodes already completed and must not be \
             restructured. Re-emit them identically or leave them out:\n",
        );
        for id in locked {
            prompt.push_str(&format!("- {id}\n"));
        }
    }
    prompt
}

/// Retry prompt carrying the validation reasons, capped.
pub fn append_validation_reasons(prompt: &str, reasons: &[String]) -> String {
    let mut retry = prompt.to_string();
    retry.push_str("\n## Previous attempt was rejected\n");
    for reason in reasons.iter().take(MAX_VALIDATION_REASONS) {
        retry.push_str(&format!("- {reason}\n"));
    }
    retry
}

pub fn truncate_summary(raw: &str) -> String {
    if raw.chars().count() <= MAX_SUMMARY_CHARS {
        raw.to_string()
    } else {
        raw.chars().take(MAX_SUMMARY_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agx_graph::NodeType;

    #[test]
    fn build_work_prompt_expected_all_sections() {
        let task = TaskSpec {
            id: "t1".to_string(),
            description: Some("Ship the widget".to_string()),
            ..TaskSpec::default()
        };
        let mut node = Node::new("build", NodeType::Work);
        node.title = Some("Build the widget".to_string());
        node.where_ = vec!["src/widget.rs".to_string()];
        node.what_changes = vec!["add widget".to_string()];
        node.acceptance_criteria = vec!["widget renders".to_string()];
        node.todos = vec!["write widget".to_string()];
        node.verification = vec!["cargo test".to_string()];

        let prompt = build_work_prompt(&task, &node);
        for heading in [
            "Where",
            "Planned Changes",
            "Acceptance Criteria",
            "To Dos",
            "Validation Expectations",
        ] {
            assert!(prompt.contains(heading), "missing section {heading}");
        }
        assert!(prompt.contains("Ship the widget"));
    }

    #[test]
    fn build_plan_prompt_rescope_expected_snapshot_and_locked_list() {
        let task = TaskSpec::default();
        let mut graph = Graph::new("g1");
        let mut done = Node::new("backend", NodeType::Work);
        done.title = Some("Backend".to_string());
        done.status = agx_graph::NodeStatus::Done;
        graph.nodes.insert("backend".to_string(), done);

        let drafts = BTreeSet::from(["backend".to_string()]);
        let locked = BTreeSet::from(["backend".to_string()]);
        let prompt = build_plan_prompt(&task, &graph, &drafts, &locked);
        assert!(prompt.contains("Current plan"));
        assert!(prompt.contains("backend [done] Backend"));
        assert!(prompt.contains("Locked nodes"));
    }

    #[test]
    fn append_validation_reasons_expected_capped_at_twelve() {
        let reasons: Vec<String> = (0..20).map(|index| format!("reason {index}")).collect();
        let retry = append_validation_reasons("base", &reasons);
        assert!(retry.contains("reason 11"));
        assert!(!retry.contains("reason 12"));
    }

    #[test]
    fn truncate_summary_expected_char_cap() {
        let long = "x".repeat(MAX_SUMMARY_CHARS + 10);
        assert_eq!(truncate_summary(&long).chars().count(), MAX_SUMMARY_CHARS);
        assert_eq!(truncate_summary("short"), "short");
    }
}
