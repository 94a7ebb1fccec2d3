use miette::Diagnostic;
use thiserror::Error;

use crate::node::NodeId;

/// Fatal construction and optimization errors. Raised while the graph is
/// being built or rewritten; never from inside a running simulation
/// (simulation asserts and warnings go through the callback interface).
#[derive(Debug, Error, Diagnostic)]
pub enum DesignError {
    #[error("type mismatch connecting output {from:?} to input {to:?}: {from_type} vs {to_type}")]
    #[diagnostic(help("drivers must match the declared input type, up to dependency coercion"))]
    TypeMismatch {
        from: NodeId,
        to: NodeId,
        from_type: String,
        to_type: String,
    },

    #[error("illegal connection on node {node:?}: {reason}")]
    IllegalConnection { node: NodeId, reason: String },

    #[error("unresolved reference to node {node:?}")]
    UnresolvedReference { node: NodeId },

    #[error("combinational cycle through {count} nodes:\n{report}")]
    #[diagnostic(help(
        "every feedback path must pass through a register or a memory port; \
         the listed nodes form the unsatisfiable sub-graph"
    ))]
    CombinationalCycle { count: usize, report: String },

    #[error("write ports of one memory use different clocks (ports {first:?} and {second:?})")]
    WritePortClockMismatch { first: NodeId, second: NodeId },

    #[error("reset value of register {register:?} is not constant")]
    #[diagnostic(help("the RESET_VALUE input must reach a constant node through signal nodes only"))]
    ResetValueNotConstant { register: NodeId },

    #[error("memory {memory:?} cannot be mapped: {reason}")]
    MemoryMapping { memory: NodeId, reason: String },
}

pub type Result<T> = std::result::Result<T, DesignError>;
