use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(String),
    #[error("storage serialization error: {0}")]
    Serialization(String),
    #[error("invalid slug: {0}")]
    InvalidSlug(String),
    #[error("invalid run id: {0}")]
    InvalidRunId(String),
    #[error("invalid stage: {0}")]
    InvalidStage(String),
    #[error("run '{0}' is finalized and refuses further writes")]
    RunFinalized(String),
    #[error("task lock held: {0}")]
    LockHeld(String),
    #[error("event payload must be a JSON object")]
    NonObjectEvent,
}

pub type StoreResult<T> = Result<T, StoreError>;
