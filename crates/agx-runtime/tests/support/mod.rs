//! Test doubles for the execution loop: an in-memory graph server, a
//! scripted agent engine, and a harness wiring them to a temp task store.

use agx_runtime::{
    AgentRunner, CloudTransport, ExecEventSink, ExecutionConfig, LoopBudgets, NeverCancelled,
    NoopGateRunner, PlanRequest, RuntimeError, RuntimeResult, WorkRequest,
};
use agx_store::{Stage, StoreRoot, TaskStore};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// In-memory stand-in for the cloud graph endpoint. GET serves the stored
/// payload (after draining scripted failures); PATCH applies optimistic
/// concurrency, bumps the version, and echoes the updated graph without the
/// runtime-authoritative fields.
pub struct RecordingTransport {
    graph: Mutex<Value>,
    version: Mutex<u64>,
    get_failures: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<String>>,
    pub reject_flat_shape: bool,
}

impl RecordingTransport {
    pub fn new(initial_graph: Value) -> Self {
        let version = initial_graph
            .get("graphVersion")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        Self {
            graph: Mutex::new(initial_graph),
            version: Mutex::new(version),
            get_failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            reject_flat_shape: false,
        }
    }

    pub fn with_get_failures(self, failures: &[&str]) -> Self {
        self.get_failures
            .lock()
            .expect("failure mutex should lock")
            .extend(failures.iter().map(|reason| reason.to_string()));
        self
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .expect("call mutex should lock")
            .iter()
            .filter(|call| call.starts_with(method))
            .count()
    }

    pub fn current_graph(&self) -> Value {
        self.graph.lock().expect("graph mutex should lock").clone()
    }

    pub fn current_version(&self) -> u64 {
        *self.version.lock().expect("version mutex should lock")
    }
}

#[async_trait]
impl CloudTransport for RecordingTransport {
    async fn request(
        &self,
        method: &str,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> RuntimeResult<Value> {
        self.calls
            .lock()
            .expect("call mutex should lock")
            .push(format!("{method} {endpoint}"));

        match method {
            "GET" => {
                if let Some(reason) = self
                    .get_failures
                    .lock()
                    .expect("failure mutex should lock")
                    .pop_front()
                {
                    return Err(RuntimeError::Transport(reason));
                }
                Ok(json!({ "graph": self.current_graph() }))
            }
            "PATCH" => {
                let payload = payload
                    .ok_or_else(|| RuntimeError::Transport("PATCH requires a body".to_string()))?;
                let flat = if payload.get("graphId").is_some() {
                    if self.reject_flat_shape {
                        return Err(RuntimeError::Transport(
                            "HTTP 422 flat shape unsupported".to_string(),
                        ));
                    }
                    payload.clone()
                } else if let Some(inner) = payload.get("graph") {
                    inner.clone()
                } else {
                    return Err(RuntimeError::Transport(
                        "HTTP 400 unrecognized payload shape".to_string(),
                    ));
                };

                let if_match = payload
                    .get("ifMatchGraphVersion")
                    .or_else(|| flat.get("ifMatchGraphVersion"))
                    .and_then(Value::as_u64);
                let mut version = self.version.lock().expect("version mutex should lock");
                if if_match != Some(*version) {
                    return Err(RuntimeError::Transport(format!(
                        "HTTP 409 version conflict: expected {}, got {if_match:?}",
                        *version
                    )));
                }
                *version += 1;

                let stored = json!({
                    "id": flat.get("graphId").cloned().unwrap_or(json!("g1")),
                    "graphVersion": *version,
                    "mode": flat.get("mode").cloned().unwrap_or(json!("PROJECT")),
                    "nodes": flat.get("nodes").cloned().unwrap_or(json!({})),
                    "edges": flat.get("edges").cloned().unwrap_or(json!([])),
                    "policy": flat.get("policy").cloned().unwrap_or(json!({})),
                    "doneCriteria": flat.get("doneCriteria").cloned().unwrap_or(json!({})),
                });
                *self.graph.lock().expect("graph mutex should lock") = stored.clone();
                Ok(stored)
            }
            other => Err(RuntimeError::Transport(format!(
                "unsupported method {other}"
            ))),
        }
    }
}

/// Scripted agent engine. Work calls drain the scripted results and fall
/// back to success; plan calls drain scripted outputs and fail when empty.
#[derive(Default)]
pub struct ScriptedAgent {
    work_results: Mutex<VecDeque<RuntimeResult<String>>>,
    plan_outputs: Mutex<VecDeque<RuntimeResult<String>>>,
    pub work_calls: AtomicUsize,
    pub plan_calls: AtomicUsize,
}

impl ScriptedAgent {
    pub fn with_plan_outputs(outputs: Vec<RuntimeResult<String>>) -> Self {
        Self {
            plan_outputs: Mutex::new(outputs.into()),
            ..Self::default()
        }
    }

    pub fn push_work_result(&self, result: RuntimeResult<String>) {
        self.work_results
            .lock()
            .expect("work mutex should lock")
            .push_back(result);
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgent {
    async fn run_work(&self, _request: WorkRequest) -> RuntimeResult<String> {
        self.work_calls.fetch_add(1, Ordering::SeqCst);
        self.work_results
            .lock()
            .expect("work mutex should lock")
            .pop_front()
            .unwrap_or_else(|| Ok("completed".to_string()))
    }

    async fn run_plan(&self, _request: PlanRequest) -> RuntimeResult<String> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        self.plan_outputs
            .lock()
            .expect("plan mutex should lock")
            .pop_front()
            .unwrap_or_else(|| Err(RuntimeError::Engine("no scripted plan output".to_string())))
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub store: TaskStore,
    pub transport: Arc<RecordingTransport>,
    pub agent: Arc<ScriptedAgent>,
}

impl Harness {
    pub fn new(initial_graph: Value) -> Self {
        Self::with_parts(
            RecordingTransport::new(initial_graph),
            ScriptedAgent::default(),
        )
    }

    pub fn with_parts(transport: RecordingTransport, agent: ScriptedAgent) -> Self {
        let temp = TempDir::new().expect("temp dir should be created");
        let root = StoreRoot::new(temp.path());
        let store = TaskStore::open(&root, "proj", "task-one").expect("store should open");
        Self {
            temp,
            store,
            transport: Arc::new(transport),
            agent: Arc::new(agent),
        }
    }

    pub fn config(&self) -> ExecutionConfig {
        ExecutionConfig {
            provider: "agent".to_string(),
            model: Some("m1".to_string()),
            stage: Stage::Execute,
            workspace_dir: self.temp.path().to_path_buf(),
            agent: self.agent.clone(),
            gates: Arc::new(NoopGateRunner),
            cloud: self.transport.clone(),
            cancellation: Arc::new(NeverCancelled),
            events: ExecEventSink::default(),
            budgets: LoopBudgets::default(),
        }
    }
}
