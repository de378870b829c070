use thiserror::Error;

/// Prefix for fatal graph-shape violations surfaced at load time.
pub const SHAPE_ERROR_PREFIX: &str = "[v2-required]";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("[v2-required] {0}")]
    InvalidShape(String),
    #[error("graph serialization error: {0}")]
    Serialization(String),
}

pub type GraphResult<T> = Result<T, GraphError>;
