//! Predicates that accept or reject a match before it is rewritten.

use qatfuse_ir::{Graph, Node, OpKind, Operand};

use crate::error::FilterError;
use crate::matcher::InternalMatch;

/// Decides whether a match should be rewritten.
///
/// Arguments are the match, the target graph and the pattern graph.
pub type MatchFilter = fn(&InternalMatch, &Graph, &Graph) -> Result<bool, FilterError>;

/// Evaluates `filters` in order; a match is kept only if every filter accepts it.
pub fn accept_all(
    filters: &[MatchFilter],
    m: &InternalMatch,
    target: &Graph,
    pattern: &Graph,
) -> Result<bool, FilterError> {
    for filter in filters {
        if !filter(m, target, pattern)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn interior_node<'g>(
    m: &InternalMatch,
    target: &'g Graph,
    kind: &OpKind,
    label: &'static str,
) -> Result<&'g Node, FilterError> {
    m.interior()
        .filter_map(|id| target.node(id))
        .find(|n| n.kind == *kind)
        .ok_or(FilterError::MissingNode(label))
}

fn interior_convolution<'g>(m: &InternalMatch, target: &'g Graph) -> Result<&'g Node, FilterError> {
    interior_node(m, target, &OpKind::Convolution, "convolution")
}

fn present(node: &Node, index: usize) -> bool {
    node.operand(index).is_some_and(|o| !o.is_none())
}

/// Accepts matches whose convolution has a bias operand.
pub fn has_conv_bias(
    m: &InternalMatch,
    target: &Graph,
    _pattern: &Graph,
) -> Result<bool, FilterError> {
    let conv = interior_convolution(m, target)?;
    Ok(present(conv, 2))
}

/// Accepts matches whose convolution has no bias operand.
pub fn no_conv_bias(
    m: &InternalMatch,
    target: &Graph,
    pattern: &Graph,
) -> Result<bool, FilterError> {
    has_conv_bias(m, target, pattern).map(|has| !has)
}

/// Accepts matches whose batch norm has an affine weight and a running
/// variance, the two inputs of the weight scale factor.
pub fn bn_has_scale_inputs(
    m: &InternalMatch,
    target: &Graph,
    _pattern: &Graph,
) -> Result<bool, FilterError> {
    let bn = interior_node(m, target, &OpKind::NativeBatchNorm, "batch norm")?;
    Ok(present(bn, 1) && present(bn, 4))
}

/// Rejects matches whose convolution is transposed; its output channels sit
/// on weight axis 1.
pub fn conv_not_transposed(
    m: &InternalMatch,
    target: &Graph,
    _pattern: &Graph,
) -> Result<bool, FilterError> {
    let conv = interior_convolution(m, target)?;
    let transposed = conv
        .operand(6)
        .and_then(Operand::as_literal)
        .and_then(|l| l.as_bool())
        .unwrap_or(false);
    Ok(!transposed)
}
