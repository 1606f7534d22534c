//! Error types for the qatfuse IR.

use crate::graph::NodeId;

/// Structural invariant violations detected while mutating or committing a graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IrError {
    /// A node id does not refer to a live node.
    #[error("node {0} is not part of the graph")]
    UnknownNode(NodeId),

    /// Two nodes share the same identity.
    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),

    /// Two nodes share the same name.
    #[error("duplicate node name '{0}'")]
    DuplicateName(String),

    /// An operand refers to a node that is not placed before its user.
    #[error("node '{node}' uses {operand} which is not defined before it (cycle or dangling operand)")]
    OperandNotDominated { node: String, operand: NodeId },

    /// A node was erased while other nodes (or graph outputs) still use it.
    #[error("cannot erase node '{node}': still used by {users:?}")]
    NodeHasUsers { node: String, users: Vec<NodeId> },

    /// A quantization annotation is keyed by a node that is no longer in the graph.
    #[error("quantization annotation on node '{node}' references dead node {key}")]
    StaleAnnotationKey { node: String, key: NodeId },

    /// A metadata entry exists for a node that is no longer in the graph.
    #[error("metadata recorded for dead node {0}")]
    OrphanMetadata(NodeId),

    /// A constant-attribute node names a constant missing from the graph storage.
    #[error("node '{node}' loads unknown constant '{target}'")]
    UnknownConstant { node: String, target: String },

    /// A graph output refers to a dead node.
    #[error("graph output {0} is not part of the graph")]
    DanglingOutput(NodeId),

    /// An operand index is out of range for a node.
    #[error("node '{node}' has no operand {index} (it has {len})")]
    OperandOutOfRange {
        node: String,
        index: usize,
        len: usize,
    },
}
