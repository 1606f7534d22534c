//! Errors raised while evaluating kernels or interpreting a graph.

use qatfuse_ir::NodeId;

/// Errors that can occur while evaluating a graph numerically.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    /// Operand shapes are incompatible for the operator.
    #[error("{op}: incompatible shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// The operator (or an operator configuration) cannot be evaluated.
    #[error("unsupported operator: {0}")]
    Unsupported(String),

    /// An operand has the wrong form for its position.
    #[error("node '{node}': operand {index} must be {expected}")]
    BadOperand {
        node: String,
        index: usize,
        expected: &'static str,
    },

    /// The number of provided inputs does not match the graph's placeholders.
    #[error("graph has {expected} input(s) but {got} were provided")]
    InputCount { expected: usize, got: usize },

    /// A constant load names a tensor missing from the graph.
    #[error("missing constant '{0}'")]
    MissingConstant(String),

    /// A node's value was requested before it was computed.
    #[error("value of node {0} is not available")]
    MissingValue(NodeId),
}
