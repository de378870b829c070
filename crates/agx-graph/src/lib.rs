//! Execution-graph model for agx tasks.
//!
//! A task owns one DAG of work and gate nodes. This crate holds the wire
//! model, ingest normalization, the dependency predicates the scheduler
//! relies on, the scheduler tick itself, and the planner subtree
//! merge/replace algorithm.

pub mod errors;
pub mod model;
pub mod normalize;
pub mod plan;
pub mod predicates;
pub mod scheduler;

pub use errors::*;
pub use model::*;
pub use normalize::*;
pub use plan::*;
pub use predicates::*;
pub use scheduler::*;
