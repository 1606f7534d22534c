//! Carries node metadata and literal operands from a replaced conv + batch
//! norm block onto its replacement.
//!
//! Pattern placeholders are never part of a rewrite, so only the interior
//! convolution, batch norm and getitem (plus any quantize / dequantize nodes)
//! need fixing up.

use std::ops::Range;

use qatfuse_ir::{Graph, IrError, Node, NodeId, OpKind, Operand};
use qatfuse_rewrite::{OriginalNode, ReplacedPattern};

use crate::error::FusionError;

/// stride, padding, dilation, transposed, output padding, groups
const CONV_LITERALS: Range<usize> = 3..9;
/// training, momentum, eps
const BN_LITERALS: Range<usize> = 5..8;
const BN_EPS: usize = 7;
/// Quantize / dequantize operands after `(x, scale, zero_point)`.
const QDQ_LITERALS_START: usize = 3;

/// The single replacement node of `kind`.
pub(crate) fn replacement_of_kind(
    graph: &Graph,
    replaced: &ReplacedPattern,
    kind: &OpKind,
    label: &'static str,
) -> Result<NodeId, FusionError> {
    let found: Vec<NodeId> = replaced
        .replacements
        .iter()
        .copied()
        .filter(|&id| graph.node(id).is_some_and(|n| &n.kind == kind))
        .collect();
    match found[..] {
        [id] => Ok(id),
        _ => Err(FusionError::NodeCount {
            kind: label,
            found: found.len(),
        }),
    }
}

fn original_of_kind<'r>(
    replaced: &'r ReplacedPattern,
    kind: &OpKind,
    label: &'static str,
) -> Result<&'r OriginalNode, FusionError> {
    replaced
        .original_of_kind(kind)
        .ok_or_else(|| FusionError::NodeCount {
            kind: label,
            found: replaced.originals.iter().filter(|o| &o.node.kind == kind).count(),
        })
}

/// Copies metadata and literal arguments of the replaced convolution, batch
/// norm and getitem onto their replacements.
pub fn copy_over_metadata(graph: &mut Graph, replaced: &ReplacedPattern) -> Result<(), FusionError> {
    let conv = replacement_of_kind(graph, replaced, &OpKind::Convolution, "convolution")?;
    let bn = replacement_of_kind(graph, replaced, &OpKind::NativeBatchNorm, "batch norm")?;
    let getitem = replacement_of_kind(graph, replaced, &OpKind::GetItem, "getitem")?;
    let conv_orig = original_of_kind(replaced, &OpKind::Convolution, "convolution")?;
    let bn_orig = original_of_kind(replaced, &OpKind::NativeBatchNorm, "batch norm")?;
    let getitem_orig = original_of_kind(replaced, &OpKind::GetItem, "getitem")?;

    for (original, new) in [(conv_orig, conv), (bn_orig, bn), (getitem_orig, getitem)] {
        copy_node_meta(graph, original, new)?;
    }

    copy_literals(graph, &conv_orig.node, conv, CONV_LITERALS)?;
    copy_literals(graph, &bn_orig.node, bn, BN_LITERALS)?;
    sync_scale_factor_eps(graph, replaced, &bn_orig.node, bn)?;
    copy_qdq_literals(graph, replaced)?;
    Ok(())
}

fn copy_node_meta(graph: &mut Graph, original: &OriginalNode, new: NodeId) -> Result<(), FusionError> {
    let Some(meta) = &original.meta else {
        return Ok(());
    };
    let mut copied = meta.without_quantization();
    if let Some(annotation) = &meta.quantization {
        if original.node.kind == OpKind::Convolution && annotation.input_count() < 2 {
            return Err(FusionError::MissingQuantSpec {
                node: original.node.name.clone(),
                expected: 2,
                found: annotation.input_count(),
            });
        }
        let operands: Vec<NodeId> = graph
            .node(new)
            .ok_or(IrError::UnknownNode(new))?
            .node_operands()
            .collect();
        let (rebuilt, dropped) = annotation.rekeyed_onto(&operands);
        if !dropped.is_empty() {
            log::debug!(
                "dropped {} input spec(s) of '{}' with no matching operand on the replacement",
                dropped.len(),
                original.node.name
            );
        }
        copied.quantization = Some(rebuilt);
    }
    graph.meta.insert(new, copied);
    Ok(())
}

/// Copies literal (and absent) operands in `range` from `from` to `to`.
fn copy_literals(graph: &mut Graph, from: &Node, to: NodeId, range: Range<usize>) -> Result<(), FusionError> {
    for index in range {
        match from.operand(index) {
            Some(Operand::Node(_)) | None => {}
            Some(operand) => graph.set_operand(to, index, operand.clone())?,
        }
    }
    Ok(())
}

/// The training replacement recomputes `sqrt(running_var + eps)`; keep its
/// epsilon in step with the batch norm it replaced.
fn sync_scale_factor_eps(
    graph: &mut Graph,
    replaced: &ReplacedPattern,
    original_bn: &Node,
    bn: NodeId,
) -> Result<(), FusionError> {
    let Some(eps @ Operand::Literal(_)) = original_bn.operand(BN_EPS).cloned() else {
        return Ok(());
    };
    let Some(running_var) = graph.node(bn).and_then(|n| n.operand(4)).and_then(Operand::as_node) else {
        return Ok(());
    };
    let adds: Vec<NodeId> = replaced
        .replacements
        .iter()
        .copied()
        .filter(|&id| {
            graph.node(id).is_some_and(|n| {
                n.kind == OpKind::Add
                    && n.operand(0).and_then(Operand::as_node) == Some(running_var)
                    && n.operand(1).and_then(Operand::as_literal).is_some()
            })
        })
        .collect();
    for add in adds {
        graph.set_operand(add, 1, eps.clone())?;
    }
    Ok(())
}

fn is_qdq(kind: &OpKind) -> bool {
    kind.is_quantize() || kind.is_dequantize()
}

/// Pairs replaced and replacement quantize / dequantize nodes in order and
/// copies their range / dtype / axis literals.
fn copy_qdq_literals(graph: &mut Graph, replaced: &ReplacedPattern) -> Result<(), FusionError> {
    let originals: Vec<&Node> = replaced
        .originals
        .iter()
        .map(|o| &o.node)
        .filter(|n| is_qdq(&n.kind))
        .collect();
    let news: Vec<NodeId> = replaced
        .replacements
        .iter()
        .copied()
        .filter(|&id| graph.node(id).is_some_and(|n| is_qdq(&n.kind)))
        .collect();
    if originals.len() != news.len() {
        log::debug!(
            "{} quantize/dequantize node(s) replaced by {}, literals not copied",
            originals.len(),
            news.len()
        );
        return Ok(());
    }
    for (original, new) in originals.into_iter().zip(news) {
        let same_kind = graph.node(new).is_some_and(|n| n.kind == original.kind);
        if !same_kind {
            log::debug!("'{}' has no matching replacement node, literals not copied", original.name);
            continue;
        }
        copy_literals(graph, original, new, QDQ_LITERALS_START..original.operands.len())?;
    }
    Ok(())
}
