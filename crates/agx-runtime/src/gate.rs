//! Verification-gate seam and verdict interpretation.
//!
//! The loop never parses check output itself; it only consumes the verdict
//! shape the gate runner reports.

use crate::errors::RuntimeResult;
use agx_graph::NodeStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateVerdict {
    pub passed: bool,
    pub results: Vec<Value>,
    pub verify_failures: u32,
    /// Retries are exhausted; the gate fails for good.
    pub force_action: bool,
    /// The check is semantic and needs a human to adjudicate.
    pub needs_llm: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[async_trait]
pub trait GateRunner: Send + Sync {
    async fn run(
        &self,
        checks: &[String],
        cwd: &Path,
        verify_failures: u32,
    ) -> RuntimeResult<GateVerdict>;
}

/// Passes every gate without running anything. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct NoopGateRunner;

#[async_trait]
impl GateRunner for NoopGateRunner {
    async fn run(
        &self,
        _checks: &[String],
        _cwd: &Path,
        verify_failures: u32,
    ) -> RuntimeResult<GateVerdict> {
        Ok(GateVerdict {
            passed: true,
            verify_failures,
            ..GateVerdict::default()
        })
    }
}

/// Map a verdict onto the gate node's next status. Exhaustion beats
/// escalation beats the plain pass/fail bit.
pub fn gate_status_from_verdict(verdict: &GateVerdict) -> NodeStatus {
    if verdict.force_action {
        NodeStatus::Failed
    } else if verdict.needs_llm {
        NodeStatus::AwaitingHuman
    } else if verdict.passed {
        NodeStatus::Passed
    } else {
        NodeStatus::Failed
    }
}
