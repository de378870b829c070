//! Canonical per-task state files: `task.json`, `working_set.md`,
//! `approvals.json`, `last_run.json`, and the per-project `index.json`.

use crate::atomic::{read_json_safe, write_json_atomic, write_text_atomic};
use crate::clock::{hex_suffix, now_rfc3339};
use crate::errors::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

pub const TASK_STATE_FILE: &str = "task.json";
pub const WORKING_SET_FILE: &str = "working_set.md";
pub const APPROVALS_FILE: &str = "approvals.json";
pub const LAST_RUN_FILE: &str = "last_run.json";
pub const GRAPH_FILE: &str = "graph.json";
pub const INDEX_FILE: &str = "index.json";

/// Hard character cap for the working set.
pub const WORKING_SET_MAX_CHARS: usize = 16_000;
const WORKING_SET_TRUNCATION_MARKER: &str = "\n\n[working set truncated]\n";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub user_request: String,
    pub task_slug: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub fn read_task_state(task_dir: &Path) -> StoreResult<Option<TaskState>> {
    read_json_safe(&task_dir.join(TASK_STATE_FILE))
}

pub fn init_task_state(task_dir: &Path, user_request: &str, task_slug: &str) -> StoreResult<TaskState> {
    if let Some(existing) = read_task_state(task_dir)? {
        return Ok(existing);
    }
    let state = TaskState {
        user_request: user_request.to_string(),
        task_slug: task_slug.to_string(),
        created_at: now_rfc3339(),
        title: None,
        status: None,
        updated_at: None,
        extra: BTreeMap::new(),
    };
    write_json_atomic(&task_dir.join(TASK_STATE_FILE), &state)?;
    Ok(state)
}

/// Merge a JSON object patch into `task.json`. `user_request`, `task_slug`,
/// and `created_at` are immutable and survive any patch.
pub fn update_task_state(task_dir: &Path, patch: &Value) -> StoreResult<TaskState> {
    let Some(patch_fields) = patch.as_object() else {
        return Err(StoreError::Serialization(
            "task state patch must be a JSON object".to_string(),
        ));
    };
    let Some(mut state) = read_task_state(task_dir)? else {
        return Err(StoreError::Io(format!(
            "task state missing under '{}'",
            task_dir.display()
        )));
    };

    for (key, value) in patch_fields {
        match key.as_str() {
            "user_request" | "task_slug" | "created_at" => {}
            "title" => state.title = value.as_str().map(ToOwned::to_owned),
            "status" => state.status = value.as_str().map(ToOwned::to_owned),
            other => {
                state.extra.insert(other.to_string(), value.clone());
            }
        }
    }
    state.updated_at = Some(now_rfc3339());
    write_json_atomic(&task_dir.join(TASK_STATE_FILE), &state)?;
    Ok(state)
}

/// Write `working_set.md` under the hard char cap. Oversized content goes
/// through the caller's summarizer when one is provided, otherwise it is
/// truncated with a marker.
pub fn write_working_set(
    task_dir: &Path,
    content: &str,
    summarize: Option<&dyn Fn(&str) -> String>,
) -> StoreResult<()> {
    let capped = if content.chars().count() <= WORKING_SET_MAX_CHARS {
        content.to_string()
    } else if let Some(summarize) = summarize {
        let summary = summarize(content);
        summary
            .chars()
            .take(WORKING_SET_MAX_CHARS)
            .collect::<String>()
    } else {
        let keep = WORKING_SET_MAX_CHARS - WORKING_SET_TRUNCATION_MARKER.chars().count();
        let mut truncated: String = content.chars().take(keep).collect();
        truncated.push_str(WORKING_SET_TRUNCATION_MARKER);
        truncated
    };
    write_text_atomic(&task_dir.join(WORKING_SET_FILE), &capped)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEntry {
    pub id: String,
    pub title: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Approvals {
    #[serde(default)]
    pub pending: Vec<ApprovalEntry>,
    #[serde(default)]
    pub approved: Vec<ApprovalEntry>,
    #[serde(default)]
    pub rejected: Vec<ApprovalEntry>,
}

pub fn new_approval_id() -> String {
    format!("appr_{}", hex_suffix(12))
}

pub fn read_approvals(task_dir: &Path) -> StoreResult<Approvals> {
    Ok(read_json_safe(&task_dir.join(APPROVALS_FILE))?.unwrap_or_default())
}

pub fn add_pending_approval(task_dir: &Path, title: &str) -> StoreResult<ApprovalEntry> {
    let mut approvals = read_approvals(task_dir)?;
    let entry = ApprovalEntry {
        id: new_approval_id(),
        title: title.to_string(),
        created_at: now_rfc3339(),
        decided_at: None,
    };
    approvals.pending.push(entry.clone());
    write_json_atomic(&task_dir.join(APPROVALS_FILE), &approvals)?;
    Ok(entry)
}

pub fn approve(task_dir: &Path, approval_id: &str) -> StoreResult<bool> {
    move_approval(task_dir, approval_id, ApprovalTarget::Approved)
}

pub fn reject(task_dir: &Path, approval_id: &str) -> StoreResult<bool> {
    move_approval(task_dir, approval_id, ApprovalTarget::Rejected)
}

enum ApprovalTarget {
    Approved,
    Rejected,
}

fn move_approval(task_dir: &Path, approval_id: &str, target: ApprovalTarget) -> StoreResult<bool> {
    let mut approvals = read_approvals(task_dir)?;
    let already_there = match target {
        ApprovalTarget::Approved => &approvals.approved,
        ApprovalTarget::Rejected => &approvals.rejected,
    };
    if already_there.iter().any(|entry| entry.id == approval_id) {
        return Ok(true);
    }

    let Some(position) = approvals
        .pending
        .iter()
        .position(|entry| entry.id == approval_id)
    else {
        return Ok(false);
    };
    let mut entry = approvals.pending.remove(position);
    entry.decided_at = Some(now_rfc3339());
    match target {
        ApprovalTarget::Approved => approvals.approved.push(entry),
        ApprovalTarget::Rejected => approvals.rejected.push(entry),
    }
    write_json_atomic(&task_dir.join(APPROVALS_FILE), &approvals)?;
    Ok(true)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunPointer {
    pub run_id: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    pub at: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LastRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall: Option<RunPointer>,
    #[serde(default)]
    pub stages: BTreeMap<String, RunPointer>,
}

pub fn read_last_run(task_dir: &Path) -> StoreResult<LastRun> {
    Ok(read_json_safe(&task_dir.join(LAST_RUN_FILE))?.unwrap_or_default())
}

pub fn record_last_run(
    task_dir: &Path,
    run_id: &str,
    stage: &str,
    decision: Option<&str>,
) -> StoreResult<LastRun> {
    let mut last_run = read_last_run(task_dir)?;
    let pointer = RunPointer {
        run_id: run_id.to_string(),
        stage: stage.to_string(),
        decision: decision.map(ToOwned::to_owned),
        at: now_rfc3339(),
    };
    last_run.stages.insert(stage.to_string(), pointer.clone());
    last_run.overall = Some(pointer);
    write_json_atomic(&task_dir.join(LAST_RUN_FILE), &last_run)?;
    Ok(last_run)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub task_slug: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub updated_at: String,
}

/// Idempotent upsert keyed by task slug into the per-project `index.json`.
pub fn upsert_index_entry(
    project_dir: &Path,
    task_slug: &str,
    status: &str,
    title: Option<&str>,
) -> StoreResult<IndexEntry> {
    let index_path = project_dir.join(INDEX_FILE);
    let mut entries: Vec<IndexEntry> = read_json_safe(&index_path)?.unwrap_or_default();

    let entry = IndexEntry {
        task_slug: task_slug.to_string(),
        status: status.to_string(),
        title: title.map(ToOwned::to_owned),
        updated_at: now_rfc3339(),
    };
    match entries.iter_mut().find(|e| e.task_slug == task_slug) {
        Some(existing) => *existing = entry.clone(),
        None => entries.push(entry.clone()),
    }
    write_json_atomic(&index_path, &entries)?;
    Ok(entry)
}
