//! Run directories and their lifecycle.
//!
//! A run owns `<task>/<run_id>/<stage>/` with `meta.json`, `prompt.md`,
//! `output.md`, `events.ndjson`, `artifacts/` and, once finalized,
//! `decision.json`. The decision file is written strictly last; its presence
//! is the only trusted finalization signal, so a directory without it is an
//! incomplete run eligible for recovery.

use crate::atomic::{ensure_dir, read_json_safe, write_bytes_atomic, write_json_atomic};
use crate::clock::now_rfc3339;
use crate::errors::{StoreError, StoreResult};
use crate::events::{self, append_event};
use crate::paths::{Stage, is_run_id, legacy_run_stage_dir, new_run_id, run_stage_dir};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

pub const META_FILE: &str = "meta.json";
pub const PROMPT_FILE: &str = "prompt.md";
pub const OUTPUT_FILE: &str = "output.md";
pub const DECISION_FILE: &str = "decision.json";
pub const EVENTS_FILE: &str = "events.ndjson";
pub const ARTIFACTS_DIR: &str = "artifacts";

pub const ERROR_CODE_CRASHED: &str = "CRASHED";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSizes {
    #[serde(default)]
    pub prompt_bytes: u64,
    #[serde(default)]
    pub output_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    pub project_slug: String,
    pub task_slug: String,
    pub stage: Stage,
    pub engine: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSnapshot>,
    #[serde(default)]
    pub sizes: RunSizes,
    #[serde(default)]
    pub finalized: bool,
}

/// Inputs for opening a new run directory.
#[derive(Clone, Debug)]
pub struct CreateRun {
    pub project_slug: String,
    pub task_slug: String,
    pub stage: Stage,
    pub engine: String,
    pub model: Option<String>,
    pub git: Option<GitSnapshot>,
}

#[derive(Clone, Debug)]
pub struct RunHandle {
    dir: PathBuf,
    legacy_layout: bool,
    pub meta: RunMeta,
}

impl RunHandle {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    pub fn prompt_path(&self) -> PathBuf {
        self.dir.join(PROMPT_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    pub fn decision_path(&self) -> PathBuf {
        self.dir.join(DECISION_FILE)
    }

    pub fn events_path(&self) -> PathBuf {
        self.dir.join(EVENTS_FILE)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join(ARTIFACTS_DIR)
    }

    /// The directory GC removes for this run: the `<run_id>` parent in the
    /// current layout, the run directory itself in the legacy layout.
    fn gc_root(&self) -> PathBuf {
        if self.legacy_layout {
            self.dir.clone()
        } else {
            self.dir.parent().map(Path::to_path_buf).unwrap_or_else(|| self.dir.clone())
        }
    }

    pub fn open(dir: &Path, legacy_layout: bool) -> StoreResult<Option<Self>> {
        let Some(meta) = read_json_safe::<RunMeta>(&dir.join(META_FILE))? else {
            return Ok(None);
        };
        Ok(Some(Self {
            dir: dir.to_path_buf(),
            legacy_layout,
            meta,
        }))
    }

    /// Finalization is keyed off the decision file, never the meta flag.
    pub fn is_finalized(&self) -> bool {
        self.decision_path().exists()
    }

    pub fn append_event(&self, event: Value) -> StoreResult<()> {
        append_event(&self.events_path(), event)
    }

    pub fn write_prompt(&mut self, text: &str) -> StoreResult<()> {
        self.refuse_if_finalized()?;
        write_bytes_atomic(&self.prompt_path(), text.as_bytes())?;
        self.meta.sizes.prompt_bytes = text.len() as u64;
        write_json_atomic(&self.meta_path(), &self.meta)?;
        self.append_event(events::prompt_built(self.meta.sizes.prompt_bytes))
    }

    pub fn write_output(&mut self, text: &str) -> StoreResult<()> {
        self.refuse_if_finalized()?;
        write_bytes_atomic(&self.output_path(), text.as_bytes())?;
        self.meta.sizes.output_bytes = text.len() as u64;
        write_json_atomic(&self.meta_path(), &self.meta)
    }

    pub fn write_artifact(&self, name: &str, bytes: &[u8]) -> StoreResult<PathBuf> {
        let path = self.artifacts_dir().join(name);
        write_bytes_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Append `RUN_FINISHED`, then write `decision.json` last. The ordering is
    /// the crash-safety contract: a run with a decision file always has its
    /// closing event on disk.
    pub fn finalize(&mut self, decision: &Value) -> StoreResult<()> {
        self.refuse_if_finalized()?;
        let verdict = decision
            .get("decision")
            .and_then(Value::as_str)
            .unwrap_or("done");
        self.append_event(events::run_finished(verdict))?;
        self.meta.finalized = true;
        write_json_atomic(&self.meta_path(), &self.meta)?;
        write_json_atomic(&self.decision_path(), decision)
    }

    /// Close the run with a synthetic failed decision. No-op when a decision
    /// already exists.
    pub fn fail(&mut self, error_code: &str, message: &str) -> StoreResult<()> {
        if self.is_finalized() {
            return Ok(());
        }
        self.append_event(events::run_failed(error_code, message))?;
        self.meta.finalized = true;
        write_json_atomic(&self.meta_path(), &self.meta)?;
        let decision = json!({
            "status": "failed",
            "decision": "failed",
            "error_code": error_code,
            "explanation": message,
            "at": now_rfc3339(),
        });
        write_json_atomic(&self.decision_path(), &decision)
    }

    pub fn read_decision(&self) -> StoreResult<Option<Value>> {
        read_json_safe(&self.decision_path())
    }

    fn refuse_if_finalized(&self) -> StoreResult<()> {
        if self.is_finalized() || self.meta.finalized {
            return Err(StoreError::RunFinalized(self.meta.run_id.clone()));
        }
        Ok(())
    }
}

pub fn create_run(task_dir: &Path, spec: CreateRun) -> StoreResult<RunHandle> {
    let run_id = new_run_id();
    let dir = run_stage_dir(task_dir, &run_id, spec.stage);
    ensure_dir(&dir.join(ARTIFACTS_DIR))?;

    let meta = RunMeta {
        run_id: run_id.clone(),
        project_slug: spec.project_slug,
        task_slug: spec.task_slug,
        stage: spec.stage,
        engine: spec.engine.clone(),
        model: spec.model,
        created_at: now_rfc3339(),
        git: spec.git,
        sizes: RunSizes::default(),
        finalized: false,
    };
    write_json_atomic(&dir.join(META_FILE), &meta)?;

    let handle = RunHandle {
        dir,
        legacy_layout: false,
        meta,
    };
    handle.append_event(events::run_started(
        &run_id,
        spec.stage.as_str(),
        &spec.engine,
    ))?;
    Ok(handle)
}

/// All runs for a task across both layouts, newest first.
pub fn list_runs(task_dir: &Path) -> StoreResult<Vec<RunHandle>> {
    let mut runs = Vec::new();
    let entries = match fs::read_dir(task_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
        Err(err) => {
            return Err(StoreError::Io(format!(
                "list '{}' failed: {err}",
                task_dir.display()
            )));
        }
    };

    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_run_id(&name) {
            for stage in Stage::ALL {
                let stage_dir = run_stage_dir(task_dir, &name, stage);
                if let Some(handle) = RunHandle::open(&stage_dir, false)? {
                    runs.push(handle);
                }
            }
        } else if let Ok(stage) = Stage::parse(&name) {
            let legacy_entries = fs::read_dir(&path).map_err(|err| {
                StoreError::Io(format!("list '{}' failed: {err}", path.display()))
            })?;
            for legacy in legacy_entries.filter_map(Result::ok) {
                let run_name = legacy.file_name().to_string_lossy().to_string();
                if !is_run_id(&run_name) {
                    continue;
                }
                let run_dir = legacy_run_stage_dir(task_dir, stage, &run_name);
                if let Some(handle) = RunHandle::open(&run_dir, true)? {
                    runs.push(handle);
                }
            }
        }
    }

    runs.sort_by(|a, b| b.meta.run_id.cmp(&a.meta.run_id));
    Ok(runs)
}

/// Runs with `meta.json` present and `decision.json` absent.
pub fn find_incomplete_runs(task_dir: &Path) -> StoreResult<Vec<RunHandle>> {
    Ok(list_runs(task_dir)?
        .into_iter()
        .filter(|run| !run.is_finalized())
        .collect())
}

/// Close an incomplete run with a `CRASHED` decision and open a fresh
/// `resume`-stage run that records the recovery.
pub fn create_recovery_run(
    task_dir: &Path,
    mut incomplete: RunHandle,
    spec: CreateRun,
) -> StoreResult<RunHandle> {
    let crashed_run_id = incomplete.meta.run_id.clone();
    incomplete.fail(
        ERROR_CODE_CRASHED,
        "process exited before the run was finalized",
    )?;

    let recovery = create_run(
        task_dir,
        CreateRun {
            stage: Stage::Resume,
            ..spec
        },
    )?;
    recovery.append_event(events::recovery_detected(&crashed_run_id))?;
    Ok(recovery)
}

/// Keep the newest `keep_per_stage` finalized runs per stage. Blocked and
/// failed tasks keep everything; incomplete runs are never collected.
pub fn gc_runs(
    task_dir: &Path,
    keep_per_stage: usize,
    task_status: Option<&str>,
) -> StoreResult<usize> {
    if matches!(task_status, Some("blocked") | Some("failed")) {
        return Ok(0);
    }

    let mut by_stage: std::collections::BTreeMap<Stage, Vec<RunHandle>> = Default::default();
    for run in list_runs(task_dir)? {
        if run.is_finalized() {
            by_stage.entry(run.meta.stage).or_default().push(run);
        }
    }

    let mut removed = 0usize;
    for (stage, runs) in by_stage {
        for run in runs.into_iter().skip(keep_per_stage) {
            let target = run.gc_root();
            match fs::remove_dir_all(&target) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(
                        stage = %stage,
                        path = %target.display(),
                        %err,
                        "skipping run during gc"
                    );
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::read_events;
    use tempfile::TempDir;

    fn spec(stage: Stage) -> CreateRun {
        CreateRun {
            project_slug: "proj".to_string(),
            task_slug: "task".to_string(),
            stage,
            engine: "agent".to_string(),
            model: Some("m1".to_string()),
            git: None,
        }
    }

    #[test]
    fn create_run_expected_meta_and_started_event() {
        let temp = TempDir::new().expect("temp dir should be created");
        let run = create_run(temp.path(), spec(Stage::Execute)).expect("run should be created");

        assert!(run.meta_path().exists());
        assert!(run.artifacts_dir().exists());
        assert!(!run.is_finalized());
        let events = read_events(&run.events_path()).expect("events should read");
        assert_eq!(events[0]["t"], "RUN_STARTED");
    }

    #[test]
    fn finalize_expected_event_before_decision_and_refuses_rewrites() {
        let temp = TempDir::new().expect("temp dir should be created");
        let mut run = create_run(temp.path(), spec(Stage::Execute)).expect("run should be created");
        run.write_prompt("do the thing").expect("prompt should write");

        run.finalize(&json!({"decision": "done", "explanation": "all sinks done"}))
            .expect("finalize should succeed");

        assert!(run.is_finalized());
        let events = read_events(&run.events_path()).expect("events should read");
        assert_eq!(events.last().expect("events should be non-empty")["t"], "RUN_FINISHED");
        assert!(matches!(
            run.write_prompt("again"),
            Err(StoreError::RunFinalized(_))
        ));
        assert!(matches!(
            run.finalize(&json!({"decision": "done"})),
            Err(StoreError::RunFinalized(_))
        ));
    }

    #[test]
    fn fail_expected_synthetic_failed_decision() {
        let temp = TempDir::new().expect("temp dir should be created");
        let mut run = create_run(temp.path(), spec(Stage::Plan)).expect("run should be created");
        run.fail("E_LOOP", "tick cap exceeded").expect("fail should succeed");

        let decision = run
            .read_decision()
            .expect("decision should read")
            .expect("decision should exist");
        assert_eq!(decision["status"], "failed");
        assert_eq!(decision["error_code"], "E_LOOP");

        // Second fail is a no-op once a decision exists.
        run.fail("E_OTHER", "ignored").expect("second fail should no-op");
        let decision = run
            .read_decision()
            .expect("decision should read")
            .expect("decision should exist");
        assert_eq!(decision["error_code"], "E_LOOP");
    }

    #[test]
    fn write_prompt_expected_sizes_tracked() {
        let temp = TempDir::new().expect("temp dir should be created");
        let mut run = create_run(temp.path(), spec(Stage::Execute)).expect("run should be created");
        run.write_prompt("12345").expect("prompt should write");
        run.write_output("abc").expect("output should write");

        let reopened = RunHandle::open(run.dir(), false)
            .expect("open should succeed")
            .expect("meta should exist");
        assert_eq!(reopened.meta.sizes.prompt_bytes, 5);
        assert_eq!(reopened.meta.sizes.output_bytes, 3);
    }

    #[test]
    fn find_incomplete_runs_expected_only_undecided() {
        let temp = TempDir::new().expect("temp dir should be created");
        let mut done = create_run(temp.path(), spec(Stage::Execute)).expect("run should be created");
        done.finalize(&json!({"decision": "done"})).expect("finalize should succeed");
        let open = create_run(temp.path(), spec(Stage::Execute)).expect("run should be created");

        let incomplete = find_incomplete_runs(temp.path()).expect("scan should succeed");
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].meta.run_id, open.meta.run_id);
    }

    #[test]
    fn legacy_layout_runs_expected_discovered() {
        let temp = TempDir::new().expect("temp dir should be created");
        let legacy_dir = legacy_run_stage_dir(temp.path(), Stage::Execute, "20250101-010101-abcd");
        ensure_dir(&legacy_dir).expect("dir should be created");
        let meta = RunMeta {
            run_id: "20250101-010101-abcd".to_string(),
            project_slug: "proj".to_string(),
            task_slug: "task".to_string(),
            stage: Stage::Execute,
            engine: "agent".to_string(),
            model: None,
            created_at: now_rfc3339(),
            git: None,
            sizes: RunSizes::default(),
            finalized: false,
        };
        write_json_atomic(&legacy_dir.join(META_FILE), &meta).expect("meta should write");

        let incomplete = find_incomplete_runs(temp.path()).expect("scan should succeed");
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].meta.run_id, "20250101-010101-abcd");
    }

    #[test]
    fn create_recovery_run_expected_crashed_decision_and_resume_stage() {
        let temp = TempDir::new().expect("temp dir should be created");
        let open = create_run(temp.path(), spec(Stage::Execute)).expect("run should be created");
        let crashed_id = open.meta.run_id.clone();

        let recovery = create_recovery_run(temp.path(), open, spec(Stage::Execute))
            .expect("recovery should succeed");

        assert_eq!(recovery.meta.stage, Stage::Resume);
        let events = read_events(&recovery.events_path()).expect("events should read");
        assert!(events.iter().any(|event| event["t"] == "RECOVERY_DETECTED"
            && event["crashed_run_id"] == crashed_id.as_str()));

        let incomplete = find_incomplete_runs(temp.path()).expect("scan should succeed");
        assert_eq!(incomplete.len(), 1, "only the recovery run stays open");
        assert_eq!(incomplete[0].meta.stage, Stage::Resume);
    }

    #[test]
    fn gc_runs_expected_keeps_newest_per_stage() {
        let temp = TempDir::new().expect("temp dir should be created");
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut run =
                create_run(temp.path(), spec(Stage::Execute)).expect("run should be created");
            run.finalize(&json!({"decision": "done"})).expect("finalize should succeed");
            ids.push(run.meta.run_id.clone());
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let removed = gc_runs(temp.path(), 2, Some("done")).expect("gc should succeed");
        assert_eq!(removed, 1);
        let remaining = list_runs(temp.path()).expect("list should succeed");
        assert_eq!(remaining.len(), 2);
        ids.sort();
        let oldest = &ids[0];
        assert!(remaining.iter().all(|run| &run.meta.run_id != oldest));
    }

    #[test]
    fn gc_runs_blocked_task_expected_everything_kept() {
        let temp = TempDir::new().expect("temp dir should be created");
        for _ in 0..3 {
            let mut run =
                create_run(temp.path(), spec(Stage::Execute)).expect("run should be created");
            run.finalize(&json!({"decision": "done"})).expect("finalize should succeed");
        }

        let removed = gc_runs(temp.path(), 1, Some("blocked")).expect("gc should succeed");
        assert_eq!(removed, 0);
        assert_eq!(list_runs(temp.path()).expect("list should succeed").len(), 3);
    }
}
