//! Errors raised by the matcher, filters and rewriter.

use qatfuse_ir::{IrError, NodeId};

/// A match filter could not evaluate its predicate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    /// The matched subgraph does not contain the node the filter inspects.
    #[error("matched subgraph contains no {0} node")]
    MissingNode(&'static str),
}

/// Errors that can occur while matching or rewriting.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RewriteError {
    /// The pattern graph cannot be matched.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// The replacement graph cannot be instantiated.
    #[error("invalid replacement: {0}")]
    InvalidReplacement(String),

    /// Pattern and replacement disagree on the number of inputs.
    #[error("pattern has {pattern} placeholder(s) but replacement has {replacement}")]
    ArityMismatch { pattern: usize, replacement: usize },

    /// A matched node disappeared before its rewrite was applied.
    #[error("matched node {0} is no longer part of the graph")]
    StaleMatch(NodeId),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Ir(#[from] IrError),
}
