//! Planner integration: parse a proposed sub-graph out of planner output,
//! validate it, and splice it into the task graph under the approval anchor.

use crate::model::Node;
use regex::Regex;
use std::sync::OnceLock;

pub mod merge;
pub mod parse;
pub mod validate;

pub use merge::*;
pub use parse::*;
pub use validate::*;

/// Conventional id of the plan node.
pub const PLAN_NODE_ID: &str = "plan";
/// Gate every planner-emitted subtree hangs off.
pub const PLAN_APPROVAL_ANCHOR: &str = "plan-approval";

/// A plan node is the node with id `plan`, or any work node whose title reads
/// like "generate … execution … plan".
pub fn is_plan_node(node: &Node) -> bool {
    if node.id == PLAN_NODE_ID {
        return true;
    }
    static TITLE: OnceLock<Regex> = OnceLock::new();
    let title_pattern = TITLE
        .get_or_init(|| Regex::new(r"(?i)generate.*execution.*plan").expect("static pattern should compile"));
    node.title
        .as_deref()
        .is_some_and(|title| title_pattern.is_match(title))
}
