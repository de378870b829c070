//! Task input shape and approval-mode resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The task handed to the loop. Tolerant of both snake_case and camelCase
/// key spellings across producers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional markdown body; may open with a `---`-fenced frontmatter
    /// block of key/value attributes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<Value>,
    #[serde(alias = "startNodeId", skip_serializing_if = "Option::is_none")]
    pub start_node_id: Option<String>,
    #[serde(alias = "approvalMode", skip_serializing_if = "Option::is_none")]
    pub approval_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<String>,
    #[serde(alias = "autoApprove", skip_serializing_if = "Option::is_none")]
    pub auto_approve: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TaskSpec {
    /// The task objective shown to engines: description, else content, else
    /// title, else the id.
    pub fn objective(&self) -> &str {
        self.description
            .as_deref()
            .or(self.content.as_deref())
            .or(self.title.as_deref())
            .unwrap_or(&self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalMode {
    Auto,
    Manual,
}

/// Parse a leading `---`-fenced frontmatter block of `key: value` lines.
pub fn parse_frontmatter(content: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return attributes;
    }
    for line in lines {
        if line.trim() == "---" {
            return attributes;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() {
                attributes.insert(key.to_string(), value.to_string());
            }
        }
    }
    // Unterminated fence: nothing trustworthy was declared.
    BTreeMap::new()
}

fn approval_mode_from_str(raw: &str) -> Option<ApprovalMode> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "auto" | "auto_approve" | "automatic" | "yes" | "true" => Some(ApprovalMode::Auto),
        "manual" | "review" | "human" | "no" | "false" => Some(ApprovalMode::Manual),
        _ => None,
    }
}

/// Resolve the approval mode from the task fields, then frontmatter, then
/// the `auto_approve` boolean. Unknown spellings and silence both mean
/// manual.
pub fn resolve_approval_mode(task: &TaskSpec) -> ApprovalMode {
    let frontmatter = task
        .content
        .as_deref()
        .map(parse_frontmatter)
        .unwrap_or_default();

    let candidates = [
        task.approval_mode.as_deref(),
        task.approval.as_deref(),
        frontmatter.get("approval_mode").map(String::as_str),
        frontmatter.get("approval").map(String::as_str),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(mode) = approval_mode_from_str(candidate) {
            return mode;
        }
    }

    let auto_flag = task.auto_approve == Some(true)
        || frontmatter
            .get("auto_approve")
            .is_some_and(|raw| approval_mode_from_str(raw) == Some(ApprovalMode::Auto));
    if auto_flag {
        return ApprovalMode::Auto;
    }
    ApprovalMode::Manual
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_frontmatter_expected_key_values() {
        let content = "---\napproval_mode: auto\nowner: sam\n---\nBody text";
        let attributes = parse_frontmatter(content);
        assert_eq!(attributes.get("approval_mode").map(String::as_str), Some("auto"));
        assert_eq!(attributes.get("owner").map(String::as_str), Some("sam"));
    }

    #[test]
    fn parse_frontmatter_absent_or_unterminated_expected_empty() {
        assert!(parse_frontmatter("no fence here").is_empty());
        assert!(parse_frontmatter("---\nkey: value\nnever closed").is_empty());
    }

    #[test]
    fn resolve_approval_mode_expected_field_beats_frontmatter() {
        let task = TaskSpec {
            approval_mode: Some("manual".to_string()),
            content: Some("---\napproval_mode: auto\n---\n".to_string()),
            ..TaskSpec::default()
        };
        assert_eq!(resolve_approval_mode(&task), ApprovalMode::Manual);
    }

    #[test]
    fn resolve_approval_mode_frontmatter_expected_used_when_fields_silent() {
        let task = TaskSpec {
            content: Some("---\napproval_mode: auto\n---\nDo the thing.".to_string()),
            ..TaskSpec::default()
        };
        assert_eq!(resolve_approval_mode(&task), ApprovalMode::Auto);
    }

    #[test]
    fn resolve_approval_mode_auto_approve_flag_expected_auto() {
        let task = TaskSpec {
            auto_approve: Some(true),
            ..TaskSpec::default()
        };
        assert_eq!(resolve_approval_mode(&task), ApprovalMode::Auto);
    }

    #[test]
    fn resolve_approval_mode_expected_default_manual() {
        assert_eq!(resolve_approval_mode(&TaskSpec::default()), ApprovalMode::Manual);
        let unknown = TaskSpec {
            approval_mode: Some("whenever".to_string()),
            ..TaskSpec::default()
        };
        assert_eq!(resolve_approval_mode(&unknown), ApprovalMode::Manual);
    }

    #[test]
    fn task_spec_expected_camel_case_aliases() {
        let task: TaskSpec = serde_json::from_value(json!({
            "id": "t1",
            "startNodeId": "worker",
            "approvalMode": "auto"
        }))
        .expect("task should deserialize");
        assert_eq!(task.start_node_id.as_deref(), Some("worker"));
        assert_eq!(resolve_approval_mode(&task), ApprovalMode::Auto);
    }
}
