//! Errors raised while tracing a reference computation.

use qatfuse_ir::{IrError, NodeId};

/// Errors that can occur while lowering a reference computation into a graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TraceError {
    /// The number of example inputs does not match the computation's inputs.
    #[error("'{reference}' takes {expected} input(s) but {got} example input(s) were given")]
    ArityMismatch {
        reference: String,
        expected: usize,
        got: usize,
    },

    /// A shape was requested for a value whose shape was never recorded.
    #[error("shape of traced value {0} is unknown")]
    UnknownShape(NodeId),

    /// The traced graph failed validation.
    #[error(transparent)]
    Ir(#[from] IrError),
}
