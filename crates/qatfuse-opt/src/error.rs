//! Errors raised by the fusion passes.

use qatfuse_ir::IrError;
use qatfuse_pattern::TraceError;
use qatfuse_rewrite::{FilterError, RewriteError};

/// Fatal conditions that abort a fusion pass.
///
/// A pass that fails leaves the graph partially rewritten; callers must
/// discard it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FusionError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("failed to trace pattern: {0}")]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A rewrite did not produce exactly one node of a kind the pass needs.
    #[error("expected exactly one {kind} node in the rewritten subgraph, found {found}")]
    NodeCount { kind: &'static str, found: usize },

    /// An operand is not produced by the operator the pass expects.
    #[error("operand {index} of '{node}' should come from {expected}, found {found}")]
    UnexpectedProducer {
        node: String,
        index: usize,
        expected: &'static str,
        found: String,
    },

    /// A constant load names a tensor the graph does not store.
    #[error("constant '{0}' is not stored in the graph")]
    MissingConstant(String),

    /// A quantization annotation lacks the specs the rewrite must carry over.
    #[error("annotation of '{node}' has {found} input spec(s), at least {expected} required")]
    MissingQuantSpec {
        node: String,
        expected: usize,
        found: usize,
    },

    /// Parameter tensors disagree on the channel count.
    #[error("{what} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}
