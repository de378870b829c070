//! In-process observer sink for loop progress.
//!
//! Orthogonal to the graph-embedded `runtimeEvents` audit and the NDJSON
//! product log: this stream exists so a caller can watch a live loop without
//! polling files. Disabled by default and free when disabled.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: ExecEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ExecEventKind {
    Loop(LoopEvent),
    Node(NodeEvent),
    Persist(PersistEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopEvent {
    Started {
        run_id: String,
        graph_id: String,
    },
    Completed {
        run_id: String,
        decision: String,
    },
    Failed {
        run_id: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    Promoted {
        node_id: String,
        from_status: String,
        to_status: String,
    },
    Dispatched {
        node_id: String,
        status: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistEvent {
    Saved { graph_version: u64 },
}

pub trait ExecEventObserver: Send + Sync {
    fn on_event(&self, event: &ExecEvent);
}

impl<F> ExecEventObserver for F
where
    F: Fn(&ExecEvent) + Send + Sync,
{
    fn on_event(&self, event: &ExecEvent) {
        self(event);
    }
}

pub type SharedExecEventObserver = Arc<dyn ExecEventObserver>;
pub type ExecEventSender = mpsc::UnboundedSender<ExecEvent>;
pub type ExecEventReceiver = mpsc::UnboundedReceiver<ExecEvent>;

#[derive(Clone, Default)]
pub struct ExecEventSink {
    observer: Option<SharedExecEventObserver>,
    sender: Option<ExecEventSender>,
}

impl ExecEventSink {
    pub fn with_observer(observer: SharedExecEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: ExecEventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: ExecEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn exec_event_channel() -> (ExecEventSender, ExecEventReceiver) {
    mpsc::unbounded_channel()
}
