use agx_graph::GraphError;
use agx_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    GraphLoad(String),
    #[error("graph persist failed: {0}")]
    CloudPersist(String),
    /// Transport failures display the bare message so callers can embed it
    /// in their own diagnostics.
    #[error("{0}")]
    Transport(String),
    #[error("engine error: {0}")]
    Engine(String),
    #[error("dispatch error: {0}")]
    Dispatch(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("execution cancelled")]
    Cancelled,
    #[error("runtime serialization error: {0}")]
    Serialization(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RuntimeError {
    /// Stable error code recorded on failed decisions.
    pub fn code(&self) -> &'static str {
        match self {
            Self::GraphLoad(_) => "E_GRAPH_LOAD",
            Self::CloudPersist(_) | Self::Transport(_) => "E_CLOUD",
            Self::Engine(_) => "E_ENGINE",
            Self::Dispatch(_) => "E_DISPATCH",
            Self::InvalidTask(_) => "E_TASK",
            Self::Cancelled => "E_CANCELLED",
            Self::Serialization(_) => "E_SERIALIZATION",
            Self::Graph(_) => "E_GRAPH",
            Self::Store(_) => "E_STORE",
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
