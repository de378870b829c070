//! External seams the loop depends on: the agent engine, the cloud
//! transport, and cancellation.

use crate::errors::{RuntimeError, RuntimeResult};
use async_trait::async_trait;
use serde_json::Value;

/// One work-node execution request handed to the agent engine.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkRequest {
    pub task_id: String,
    pub node_id: String,
    pub provider: String,
    pub model: Option<String>,
    pub prompt: String,
}

/// One plan-node execution request. The response must contain a JSON graph,
/// possibly fenced in markdown.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanRequest {
    pub task_id: String,
    pub node_id: String,
    pub provider: String,
    pub model: Option<String>,
    pub prompt: String,
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run_work(&self, request: WorkRequest) -> RuntimeResult<String>;
    async fn run_plan(&self, request: PlanRequest) -> RuntimeResult<String>;
}

/// Cloud transport. The loop only issues `GET` and `PATCH` against the task
/// graph endpoint; everything else is the orchestrator's business.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn request(
        &self,
        method: &str,
        endpoint: &str,
        payload: Option<&Value>,
    ) -> RuntimeResult<Value>;
}

pub trait CancellationWatcher: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct NeverCancelled;

impl CancellationWatcher for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

pub fn abort_if_cancelled(watcher: &dyn CancellationWatcher) -> RuntimeResult<()> {
    if watcher.is_cancelled() {
        return Err(RuntimeError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysCancelled;

    impl CancellationWatcher for AlwaysCancelled {
        fn is_cancelled(&self) -> bool {
            true
        }
    }

    #[test]
    fn abort_if_cancelled_expected_error_only_when_requested() {
        assert!(abort_if_cancelled(&NeverCancelled).is_ok());
        assert!(matches!(
            abort_if_cancelled(&AlwaysCancelled),
            Err(RuntimeError::Cancelled)
        ));
    }
}
