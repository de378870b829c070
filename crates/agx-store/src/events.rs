//! Append-only NDJSON event log, one JSON object per line.
//!
//! Every event carries a tag field `t` and a wall-clock `at` timestamp.

use crate::clock::now_rfc3339;
use crate::errors::{StoreError, StoreResult};
use serde_json::{Value, json};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Append one event line. Non-object payloads are rejected; a missing `at`
/// field gets the current wall-clock timestamp attached.
pub fn append_event(path: &Path, mut event: Value) -> StoreResult<()> {
    let Some(fields) = event.as_object_mut() else {
        return Err(StoreError::NonObjectEvent);
    };
    fields
        .entry("at".to_string())
        .or_insert_with(|| Value::String(now_rfc3339()));

    let mut line =
        serde_json::to_vec(&event).map_err(|err| StoreError::Serialization(err.to_string()))?;
    line.push(b'\n');

    if let Some(parent) = path.parent() {
        crate::atomic::ensure_dir(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| StoreError::Io(format!("open '{}' failed: {err}", path.display())))?;
    file.write_all(&line)
        .map_err(|err| StoreError::Io(format!("append '{}' failed: {err}", path.display())))
}

/// Read all events in order. Blank lines are skipped; unparsable lines are
/// logged and skipped rather than aborting the read.
pub fn read_events(path: &Path) -> StoreResult<Vec<Value>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(StoreError::Io(format!(
                "read '{}' failed: {err}",
                path.display()
            )));
        }
    };

    let mut events = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(event) => events.push(event),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    %err,
                    "skipping unparsable event line"
                );
            }
        }
    }
    Ok(events)
}

pub fn run_started(run_id: &str, stage: &str, engine: &str) -> Value {
    json!({ "t": "RUN_STARTED", "run_id": run_id, "stage": stage, "engine": engine })
}

pub fn prompt_built(prompt_bytes: u64) -> Value {
    json!({ "t": "PROMPT_BUILT", "prompt_bytes": prompt_bytes })
}

pub fn engine_call_started(engine: &str, model: Option<&str>) -> Value {
    json!({ "t": "ENGINE_CALL_STARTED", "engine": engine, "model": model })
}

pub fn engine_call_completed(engine: &str, status: &str) -> Value {
    json!({ "t": "ENGINE_CALL_COMPLETED", "engine": engine, "status": status })
}

pub fn run_finished(decision: &str) -> Value {
    json!({ "t": "RUN_FINISHED", "decision": decision })
}

pub fn run_failed(error_code: &str, message: &str) -> Value {
    json!({ "t": "RUN_FAILED", "error_code": error_code, "message": message })
}

pub fn recovery_detected(crashed_run_id: &str) -> Value {
    json!({ "t": "RECOVERY_DETECTED", "crashed_run_id": crashed_run_id })
}

pub fn state_updated(what: &str) -> Value {
    json!({ "t": "STATE_UPDATED", "what": what })
}
