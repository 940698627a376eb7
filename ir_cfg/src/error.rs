use thiserror::Error;

use crate::NodeId;

/// Violated structural invariants.
///
/// These are defects of the pass or of the code that built the graph, never
/// user errors. Compilation of the function stops at the first one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("branch target {target:?} is not reachable")]
    BranchTargetUnreachable { target: NodeId },
    #[error("branch {node:?} is encoded with depth {cached} but its target is {actual} constructs out")]
    BranchDepthMismatch {
        node: NodeId,
        cached: usize,
        actual: usize,
    },
    #[error("end without opening block")]
    EndWithoutOpen,
    #[error("else without if (innermost construct is {node:?})")]
    ElseWithoutIf { node: NodeId },
    #[error("construct {node:?} is never closed")]
    UnclosedConstruct { node: NodeId },
    #[error("cannot remove {node:?}: it has {preds} predecessors and {succs} successors")]
    IllegalRemoval {
        node: NodeId,
        preds: usize,
        succs: usize,
    },
    #[error("variable `{var}` used with wrong type: expected {expected}, found {found}")]
    TypeMismatch {
        var: String,
        expected: String,
        found: String,
    },
    #[error("{which} count of `{var}` dropped below zero")]
    CountUnderflow { var: String, which: &'static str },
    #[error("counts of `{var}` are stale: cached {cached:?}, actual {actual:?}")]
    CountMismatch {
        var: String,
        cached: (usize, usize),
        actual: (usize, usize),
    },
    #[error("jump {node:?} has no resolved destination")]
    UnresolvedJump { node: NodeId },
    #[error("malformed graph at {node:?}: {reason}")]
    MalformedGraph { node: NodeId, reason: String },
}

impl IrError {
    pub fn malformed(node: NodeId, reason: impl Into<String>) -> Self {
        Self::MalformedGraph {
            node,
            reason: reason.into(),
        }
    }
}
