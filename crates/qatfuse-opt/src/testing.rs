//! Graph builders shared by the unit tests.

use ndarray::{ArrayD, IxDyn};
use qatfuse_ir::{
    Graph, Literal, NodeId, OpKind, Operand, Overload, QuantAnnotation, QuantSpec, Scalar,
    TensorMeta,
};
use qatfuse_pattern::WeightQuantization;

pub(crate) const CHANNELS: usize = 2;

pub(crate) fn tensor(shape: &[usize], values: &[f32]) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(shape), values.to_vec()).unwrap()
}

pub(crate) fn conv_literals() -> [Operand; 6] {
    [
        Literal::Ints(vec![1, 1]).into(),
        Literal::Ints(vec![0, 0]).into(),
        Literal::Ints(vec![1, 1]).into(),
        Literal::Bool(false).into(),
        Literal::Ints(vec![0, 0]).into(),
        Literal::Int(1).into(),
    ]
}

/// Loads batch norm parameters for [`CHANNELS`] channels, in operand order.
pub(crate) fn bn_params(graph: &mut Graph) -> [NodeId; 4] {
    [
        graph.add_constant("bn.weight", tensor(&[CHANNELS], &[1.5, 0.5])),
        graph.add_constant("bn.bias", tensor(&[CHANNELS], &[0.1, -0.2])),
        graph.add_constant("bn.running_mean", tensor(&[CHANNELS], &[0.3, -0.1])),
        graph.add_constant("bn.running_var", tensor(&[CHANNELS], &[0.8, 1.2])),
    ]
}

pub(crate) struct ConvBnNodes {
    pub x: NodeId,
    pub weight: NodeId,
    pub bias: Option<NodeId>,
    pub conv: NodeId,
    pub bn: NodeId,
    pub getitem: NodeId,
}

/// `getitem(batch_norm_training(conv2d(x, w, b)), 0)`, annotated.
pub(crate) fn training_graph(with_bias: bool, eps: f64) -> (Graph, ConvBnNodes) {
    let mut g = Graph::new();
    let x = g.placeholder("x");
    g.meta.entry(x).tensor = Some(TensorMeta::f32([1, 1, 3, 3]));
    let weight = g.add_constant("conv.weight", tensor(&[CHANNELS, 1, 1, 1], &[0.7, -1.1]));
    let bias = with_bias.then(|| g.add_constant("conv.bias", tensor(&[CHANNELS], &[0.25, 0.5])));
    let [bn_w, bn_b, rm, rv] = bn_params(&mut g);

    let mut operands = vec![x.into(), weight.into(), Operand::from(bias)];
    operands.extend(conv_literals());
    let conv = g.add_node(OpKind::Convolution, operands, "conv");
    let bn = g.add_node(
        OpKind::NativeBatchNorm,
        vec![
            conv.into(),
            bn_w.into(),
            bn_b.into(),
            rm.into(),
            rv.into(),
            Literal::Bool(true).into(),
            Literal::Float(0.1).into(),
            Literal::Float(eps).into(),
        ],
        "bn",
    );
    let getitem = g.add_node(OpKind::GetItem, vec![bn.into(), Literal::Int(0).into()], "getitem");
    g.outputs = vec![getitem];

    let mut ann = QuantAnnotation::new()
        .with_input(x, QuantSpec::activation(0.1, 0))
        .with_input(weight, QuantSpec::weight(0.05));
    if let Some(b) = bias {
        ann.insert_input(b, QuantSpec::bias(0.005));
    }
    g.meta.set_annotation(conv, ann);
    g.meta.entry(conv).stack_trace = Some("model.conv".into());
    g.meta
        .set_annotation(getitem, QuantAnnotation::new().with_output(QuantSpec::activation(0.2, 3)));
    g.commit().unwrap();

    (
        g,
        ConvBnNodes {
            x,
            weight,
            bias,
            conv,
            bn,
            getitem,
        },
    )
}

fn per_tensor(kind: fn(Overload) -> OpKind, x: NodeId, scale: f64, zp: i64, range: (i64, i64)) -> (OpKind, Vec<Operand>) {
    (
        kind(Overload::Packet),
        vec![
            x.into(),
            Literal::Float(scale).into(),
            Literal::Int(zp).into(),
            Literal::Int(range.0).into(),
            Literal::Int(range.1).into(),
            Literal::Dtype(Scalar::I8).into(),
        ],
    )
}

/// A converted QAT conv + batch norm block with literal quantization
/// parameters and constant-backed weights, as produced by convert.
pub(crate) fn converted_graph(weight_quant: WeightQuantization, with_bias: bool) -> (Graph, ConvBnNodes) {
    let mut g = Graph::new();
    let x = g.placeholder("x");
    let weight = g.add_constant("conv.weight", tensor(&[CHANNELS, 1, 1, 1], &[0.7, -1.1]));
    let bias = with_bias.then(|| g.add_constant("conv.bias", tensor(&[CHANNELS], &[0.25, 0.5])));
    let [bn_w, bn_b, rm, rv] = bn_params(&mut g);

    let var_eps = g.add_node(OpKind::Add, vec![rv.into(), Literal::Float(1e-5).into()], "add");
    let std = g.add_node(OpKind::Sqrt, vec![var_eps.into()], "sqrt");
    let scale = g.add_node(OpKind::Div, vec![bn_w.into(), std.into()], "div");
    let scale_w = g.add_node(
        OpKind::Reshape,
        vec![scale.into(), Literal::Ints(vec![-1, 1, 1, 1]).into()],
        "reshape",
    );
    let scaled = g.add_node(OpKind::Mul, vec![weight.into(), scale_w.into()], "mul");

    let (kind, ops) = per_tensor(OpKind::DequantizePerTensor, x, 0.1, 0, (-128, 127));
    let dq_x = g.add_node(kind, ops, "dequantize");
    let zero_bias = bias.map(|b| {
        g.add_node(OpKind::ZerosLike, vec![b.into(), Literal::Dtype(Scalar::F32).into()], "zeros_like")
    });
    let dq_w = match weight_quant {
        WeightQuantization::PerTensor => {
            let (kind, ops) = per_tensor(OpKind::QuantizePerTensor, scaled, 0.02, 0, (-127, 127));
            let q = g.add_node(kind, ops, "quantize");
            let (kind, ops) = per_tensor(OpKind::DequantizePerTensor, q, 0.02, 0, (-127, 127));
            g.add_node(kind, ops, "dequantize")
        }
        WeightQuantization::PerChannel => {
            let scales = g.add_constant("conv.weight_scale", tensor(&[CHANNELS], &[0.02, 0.03]));
            let zps = g.add_constant("conv.weight_zero_point", tensor(&[CHANNELS], &[0.0, 0.0]));
            let operands = |src: NodeId| -> Vec<Operand> {
                vec![
                    src.into(),
                    scales.into(),
                    zps.into(),
                    Literal::Int(0).into(),
                    Literal::Int(-127).into(),
                    Literal::Int(127).into(),
                    Literal::Dtype(Scalar::I8).into(),
                ]
            };
            let q = g.add_node(OpKind::QuantizePerChannel(Overload::Packet), operands(scaled), "quantize");
            g.add_node(OpKind::DequantizePerChannel(Overload::Packet), operands(q), "dequantize")
        }
    };
    let mut operands = vec![dq_x.into(), dq_w.into(), Operand::from(zero_bias)];
    operands.extend(conv_literals());
    let conv = g.add_node(OpKind::Convolution, operands, "conv");
    let scale_b = g.add_node(
        OpKind::Reshape,
        vec![scale.into(), Literal::Ints(vec![1, -1, 1, 1]).into()],
        "reshape",
    );
    let mut y = g.add_node(OpKind::Div, vec![conv.into(), scale_b.into()], "div");
    if let Some(b) = bias {
        let b = g.add_node(
            OpKind::Reshape,
            vec![b.into(), Literal::Ints(vec![1, -1, 1, 1]).into()],
            "reshape",
        );
        y = g.add_node(OpKind::Add, vec![y.into(), b.into()], "add");
    }
    let bn = g.add_node(
        OpKind::NativeBatchNorm,
        vec![
            y.into(),
            bn_w.into(),
            bn_b.into(),
            rm.into(),
            rv.into(),
            Literal::Bool(true).into(),
            Literal::Float(0.1).into(),
            Literal::Float(1e-5).into(),
        ],
        "bn",
    );
    let getitem = g.add_node(OpKind::GetItem, vec![bn.into(), Literal::Int(0).into()], "getitem");
    let (kind, ops) = per_tensor(OpKind::QuantizePerTensor, getitem, 0.2, 3, (-128, 127));
    let q_out = g.add_node(kind, ops, "quantize");
    g.outputs = vec![q_out];
    g.meta.set_annotation(
        conv,
        QuantAnnotation::new()
            .with_input(dq_x, QuantSpec::activation(0.1, 0))
            .with_input(dq_w, QuantSpec::weight(0.02)),
    );
    g.commit().unwrap();

    (
        g,
        ConvBnNodes {
            x,
            weight,
            bias,
            conv,
            bn,
            getitem,
        },
    )
}
