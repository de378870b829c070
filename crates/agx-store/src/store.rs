//! Facade over one task's storage tree. The execution loop talks to this
//! type; everything underneath is plain files.

use crate::atomic::{ensure_dir, read_json_safe, write_json_atomic};
use crate::errors::StoreResult;
use crate::lock::{TaskLock, lock_stale_ms_from_env};
use crate::paths::{Stage, StoreRoot};
use crate::runs::{
    CreateRun, GitSnapshot, RunHandle, create_recovery_run, create_run, find_incomplete_runs,
    gc_runs, list_runs,
};
use crate::state::{
    self, GRAPH_FILE, IndexEntry, LastRun, TaskState, read_last_run, read_task_state,
    record_last_run, update_task_state, upsert_index_entry, write_working_set,
};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct TaskStore {
    project_slug: String,
    task_slug: String,
    project_dir: PathBuf,
    task_dir: PathBuf,
}

impl TaskStore {
    pub fn open(root: &StoreRoot, project_slug: &str, task_slug: &str) -> StoreResult<Self> {
        let project_dir = root.project_dir(project_slug)?;
        let task_dir = root.task_dir(project_slug, task_slug)?;
        ensure_dir(&task_dir)?;
        Ok(Self {
            project_slug: project_slug.to_string(),
            task_slug: task_slug.to_string(),
            project_dir,
            task_dir,
        })
    }

    pub fn project_slug(&self) -> &str {
        &self.project_slug
    }

    pub fn task_slug(&self) -> &str {
        &self.task_slug
    }

    pub fn task_dir(&self) -> &Path {
        &self.task_dir
    }

    pub fn acquire_lock(&self) -> StoreResult<TaskLock> {
        TaskLock::acquire(&self.task_dir, lock_stale_ms_from_env())
    }

    pub fn create_run(
        &self,
        stage: Stage,
        engine: &str,
        model: Option<&str>,
        git: Option<GitSnapshot>,
    ) -> StoreResult<RunHandle> {
        create_run(&self.task_dir, self.run_spec(stage, engine, model, git))
    }

    /// Close every incomplete run with a `CRASHED` decision. When any were
    /// found, the returned handle is a fresh `resume`-stage run recording the
    /// recovery; the caller drives it as this invocation's run.
    pub fn recover_incomplete_runs(
        &self,
        engine: &str,
        model: Option<&str>,
    ) -> StoreResult<Option<RunHandle>> {
        let mut incomplete = find_incomplete_runs(&self.task_dir)?;
        let Some(first) = incomplete.pop() else {
            return Ok(None);
        };
        for mut stray in incomplete {
            stray.fail(
                crate::runs::ERROR_CODE_CRASHED,
                "process exited before the run was finalized",
            )?;
        }
        let recovery = create_recovery_run(
            &self.task_dir,
            first,
            self.run_spec(Stage::Resume, engine, model, None),
        )?;
        Ok(Some(recovery))
    }

    pub fn find_incomplete_runs(&self) -> StoreResult<Vec<RunHandle>> {
        find_incomplete_runs(&self.task_dir)
    }

    pub fn list_runs(&self) -> StoreResult<Vec<RunHandle>> {
        list_runs(&self.task_dir)
    }

    pub fn gc_runs(&self, keep_per_stage: usize, task_status: Option<&str>) -> StoreResult<usize> {
        gc_runs(&self.task_dir, keep_per_stage, task_status)
    }

    pub fn write_task_graph(&self, graph: &Value) -> StoreResult<()> {
        write_json_atomic(&self.task_dir.join(GRAPH_FILE), graph)
    }

    pub fn read_task_graph(&self) -> StoreResult<Option<Value>> {
        read_json_safe(&self.task_dir.join(GRAPH_FILE))
    }

    pub fn init_task_state(&self, user_request: &str) -> StoreResult<TaskState> {
        state::init_task_state(&self.task_dir, user_request, &self.task_slug)
    }

    pub fn read_task_state(&self) -> StoreResult<Option<TaskState>> {
        read_task_state(&self.task_dir)
    }

    pub fn update_task_state(&self, patch: &Value) -> StoreResult<TaskState> {
        update_task_state(&self.task_dir, patch)
    }

    pub fn write_working_set(
        &self,
        content: &str,
        summarize: Option<&dyn Fn(&str) -> String>,
    ) -> StoreResult<()> {
        write_working_set(&self.task_dir, content, summarize)
    }

    pub fn read_last_run(&self) -> StoreResult<LastRun> {
        read_last_run(&self.task_dir)
    }

    pub fn record_last_run(
        &self,
        run_id: &str,
        stage: &str,
        decision: Option<&str>,
    ) -> StoreResult<LastRun> {
        record_last_run(&self.task_dir, run_id, stage, decision)
    }

    pub fn upsert_index_entry(
        &self,
        status: &str,
        title: Option<&str>,
    ) -> StoreResult<IndexEntry> {
        upsert_index_entry(&self.project_dir, &self.task_slug, status, title)
    }

    fn run_spec(
        &self,
        stage: Stage,
        engine: &str,
        model: Option<&str>,
        git: Option<GitSnapshot>,
    ) -> CreateRun {
        CreateRun {
            project_slug: self.project_slug.clone(),
            task_slug: self.task_slug.clone(),
            stage,
            engine: engine.to_string(),
            model: model.map(ToOwned::to_owned),
            git,
        }
    }
}
