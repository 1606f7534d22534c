//! Folds batch norm statistics into the preceding convolution's constants.

use ndarray::{Array1, ArrayD};
use qatfuse_ir::{Graph, IrError, Node, NodeId, OpKind, Operand, Tensor};
use qatfuse_rewrite::ReplacedPattern;

use crate::error::FusionError;
use crate::merge::replacement_of_kind;

/// Batch norm parameters consumed by [`fuse_conv_bn_weights`].
#[derive(Clone, Copy, Debug)]
pub struct BatchNormParams<'a> {
    /// Affine scale; ones when absent.
    pub weight: Option<&'a Tensor>,
    /// Affine shift; zeros when absent.
    pub bias: Option<&'a Tensor>,
    pub running_mean: &'a Tensor,
    pub running_var: &'a Tensor,
    pub eps: f64,
}

/// Computes the convolution weight and bias equivalent to `conv` followed by
/// inference-mode batch norm.
///
/// ```text
/// scale = bn_weight / sqrt(running_var + eps)
/// weight' = weight * scale        (per output channel)
/// bias'   = (bias - running_mean) * scale + bn_bias
/// ```
///
/// Output channels are weight axis 0, or axis 1 for transposed convolutions.
/// A missing `bias` is treated as zeros. Arithmetic is carried out in `f64`.
pub fn fuse_conv_bn_weights(
    weight: &Tensor,
    bias: Option<&Tensor>,
    bn: &BatchNormParams<'_>,
    transposed: bool,
) -> Result<(Tensor, Tensor), FusionError> {
    let axis = usize::from(transposed);
    let Some(&channels) = weight.shape().get(axis) else {
        return Err(FusionError::ShapeMismatch {
            what: "convolution weight",
            expected: vec![0; axis + 1],
            found: weight.shape().to_vec(),
        });
    };

    let vector = |what: &'static str, t: Option<&Tensor>, default: f64| -> Result<Array1<f64>, FusionError> {
        match t {
            None => Ok(Array1::from_elem(channels, default)),
            Some(t) if t.shape() == [channels] => Ok(t.iter().map(|&v| f64::from(v)).collect()),
            Some(t) => Err(FusionError::ShapeMismatch {
                what,
                expected: vec![channels],
                found: t.shape().to_vec(),
            }),
        }
    };
    let bn_weight = vector("batch norm weight", bn.weight, 1.0)?;
    let bn_bias = vector("batch norm bias", bn.bias, 0.0)?;
    let mean = vector("batch norm running mean", Some(bn.running_mean), 0.0)?;
    let var = vector("batch norm running variance", Some(bn.running_var), 1.0)?;
    let conv_bias = vector("convolution bias", bias, 0.0)?;

    let scale = &bn_weight / &var.mapv(|v| (v + bn.eps).sqrt());

    let mut fused_weight: ArrayD<f64> = weight.mapv(f64::from);
    for (index, value) in fused_weight.indexed_iter_mut() {
        *value *= scale[index[axis]];
    }
    let fused_bias = (&conv_bias - &mean) * &scale + &bn_bias;

    Ok((
        fused_weight.mapv(|v| v as f32),
        fused_bias.mapv(|v| v as f32).into_dyn(),
    ))
}

fn producer<'g>(
    graph: &'g Graph,
    user: &Node,
    index: usize,
    expected: &'static str,
    accept: impl Fn(&OpKind) -> bool,
) -> Result<&'g Node, FusionError> {
    let unexpected = |found: String| FusionError::UnexpectedProducer {
        node: user.name.clone(),
        index,
        expected,
        found,
    };
    match user.operand(index) {
        Some(Operand::Node(id)) => {
            let node = graph.node(*id).ok_or(IrError::UnknownNode(*id))?;
            if accept(&node.kind) {
                Ok(node)
            } else {
                Err(unexpected(node.kind.to_string()))
            }
        }
        Some(other) => Err(unexpected(other.to_string())),
        None => Err(unexpected("no operand".into())),
    }
}

fn is_get_attr(kind: &OpKind) -> bool {
    matches!(kind, OpKind::GetAttr { .. })
}

fn attr_target(node: &Node) -> &str {
    match &node.kind {
        OpKind::GetAttr { target } => target,
        _ => "",
    }
}

/// Constant loaded by operand `index` of `user`, or `None` if the operand is
/// absent.
fn optional_constant<'g>(
    graph: &'g Graph,
    user: &Node,
    index: usize,
) -> Result<Option<(&'g Node, &'g Tensor)>, FusionError> {
    if user.operand(index).is_none_or(Operand::is_none) {
        return Ok(None);
    }
    let attr = producer(graph, user, index, "a constant", is_get_attr)?;
    let target = attr_target(attr);
    let value = graph
        .constant(target)
        .ok_or_else(|| FusionError::MissingConstant(target.to_string()))?;
    Ok(Some((attr, value)))
}

fn required_constant<'g>(graph: &'g Graph, user: &Node, index: usize) -> Result<&'g Tensor, FusionError> {
    optional_constant(graph, user, index)?
        .map(|(_, value)| value)
        .ok_or_else(|| FusionError::UnexpectedProducer {
            node: user.name.clone(),
            index,
            expected: "a constant",
            found: "None".into(),
        })
}

/// Folds the batch norm of a rewritten quantized conv + batch norm block
/// into the convolution's weight and bias constants.
///
/// The weight must be loaded through `dequantize(quantize(get_attr))`; the
/// bias must be a constant load or absent. A missing bias is materialized as
/// constant `<weight>_bias`, suffixed with `_<n>` if that name is taken. Users of the batch norm output are redirected to
/// the convolution; the batch norm itself is left for dead-code elimination.
pub fn fold_bn_weights_into_conv(graph: &mut Graph, replaced: &ReplacedPattern) -> Result<(), FusionError> {
    let conv = replacement_of_kind(graph, replaced, &OpKind::Convolution, "convolution")?;
    let bn = replacement_of_kind(graph, replaced, &OpKind::NativeBatchNorm, "batch norm")?;
    let conv_node = graph.node(conv).ok_or(IrError::UnknownNode(conv))?;
    let bn_node = graph.node(bn).ok_or(IrError::UnknownNode(bn))?;

    let dq = producer(graph, conv_node, 1, "a dequantize", OpKind::is_dequantize)?;
    let q = producer(graph, dq, 0, "a quantize", OpKind::is_quantize)?;
    let weight_attr = producer(graph, q, 0, "a constant", is_get_attr)?;
    let weight_name = attr_target(weight_attr).to_string();
    let weight = graph
        .constant(&weight_name)
        .ok_or_else(|| FusionError::MissingConstant(weight_name.clone()))?;
    let weight_users = graph.users(weight_attr.id).len();
    if weight_users > 1 {
        log::warn!("weight '{weight_name}' is loaded by {weight_users} nodes; folding rewrites it for all of them");
    }
    let bias = optional_constant(graph, conv_node, 2)?;
    let bias_name = bias.map(|(attr, _)| attr_target(attr).to_string());

    let eps = bn_node
        .operand(7)
        .and_then(Operand::as_literal)
        .and_then(|l| l.as_float())
        .ok_or_else(|| FusionError::UnexpectedProducer {
            node: bn_node.name.clone(),
            index: 7,
            expected: "a float literal",
            found: bn_node.operand(7).map_or_else(|| "no operand".into(), ToString::to_string),
        })?;
    let params = BatchNormParams {
        weight: optional_constant(graph, bn_node, 1)?.map(|(_, v)| v),
        bias: optional_constant(graph, bn_node, 2)?.map(|(_, v)| v),
        running_mean: required_constant(graph, bn_node, 3)?,
        running_var: required_constant(graph, bn_node, 4)?,
        eps,
    };
    let transposed = conv_node
        .operand(6)
        .and_then(Operand::as_literal)
        .and_then(|l| l.as_bool())
        .unwrap_or(false);

    let (fused_weight, fused_bias) = fuse_conv_bn_weights(weight, bias.map(|(_, v)| v), &params, transposed)?;

    graph.constants.insert(weight_name.clone(), fused_weight);
    match bias_name {
        Some(name) => {
            graph.constants.insert(name, fused_bias);
        }
        None => {
            let target = graph.unique_constant_name(&format!("{weight_name}_bias"));
            graph.constants.insert(target.clone(), fused_bias);
            let name = target.replace('.', "_");
            let attr = graph.insert_node_before(conv, OpKind::GetAttr { target }, Vec::new(), &name)?;
            graph.set_operand(conv, 2, Operand::Node(attr))?;
        }
    }

    let outputs: Vec<NodeId> = graph
        .users(bn)
        .into_iter()
        .filter(|&user| {
            graph.node(user).is_some_and(|n| {
                n.kind == OpKind::GetItem
                    && n.operand(1).and_then(Operand::as_literal).and_then(|l| l.as_int()) == Some(0)
            })
        })
        .collect();
    for getitem in outputs {
        graph.replace_all_uses(getitem, conv);
    }
    log::debug!("folded batch norm into constant '{weight_name}'");
    Ok(())
}
