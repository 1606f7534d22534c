//! Small demo models for the `train` and `convert` subcommands.

use ndarray::{ArrayD, IxDyn};
use qatfuse_ir::{
    Graph, Literal, NodeId, OpKind, Operand, Overload, QuantAnnotation, QuantSpec, Scalar, Tensor,
    TensorMeta,
};

/// Input channels of every demo convolution.
pub const IN_CHANNELS: usize = 2;
/// Spatial size of the demo input.
pub const SPATIAL: usize = 5;
const KERNEL: usize = 3;
const EPS: f64 = 1e-5;

/// Deterministic values in `[lo, hi)`, varied by `seed`, in row-major order.
fn ramp(shape: &[usize], seed: usize, lo: f32, hi: f32) -> Tensor {
    let mut i = 0;
    ArrayD::from_shape_fn(IxDyn(shape), |_| {
        let t = ((i * 7 + seed * 13) % 17) as f32 / 17.0;
        i += 1;
        lo + (hi - lo) * t
    })
}

/// Example input for the demo models.
pub fn input() -> ArrayD<f32> {
    ramp(&[1, IN_CHANNELS, SPATIAL, SPATIAL], 1, -1.0, 1.0)
}

fn conv_literals() -> [Operand; 6] {
    [
        Literal::Ints(vec![1, 1]).into(),
        Literal::Ints(vec![0, 0]).into(),
        Literal::Ints(vec![1, 1]).into(),
        Literal::Bool(false).into(),
        Literal::Ints(vec![0, 0]).into(),
        Literal::Int(1).into(),
    ]
}

struct Params {
    weight: NodeId,
    bias: Option<NodeId>,
    bn: [NodeId; 4],
}

fn load_params(graph: &mut Graph, channels: usize, with_bias: bool) -> Params {
    let weight_shape = [channels, IN_CHANNELS, KERNEL, KERNEL];
    let weight = graph.add_constant("conv.weight", ramp(&weight_shape, 2, -0.5, 0.5));
    let bias = with_bias.then(|| graph.add_constant("conv.bias", ramp(&[channels], 3, -0.2, 0.2)));
    let bn = [
        graph.add_constant("bn.weight", ramp(&[channels], 4, 0.5, 1.5)),
        graph.add_constant("bn.bias", ramp(&[channels], 5, -0.3, 0.3)),
        graph.add_constant("bn.running_mean", ramp(&[channels], 6, -0.2, 0.2)),
        graph.add_constant("bn.running_var", ramp(&[channels], 7, 0.5, 2.0)),
    ];
    Params { weight, bias, bn }
}

fn batch_norm(graph: &mut Graph, input: NodeId, bn: [NodeId; 4]) -> NodeId {
    let [weight, bias, mean, var] = bn;
    let out = graph.add_node(
        OpKind::NativeBatchNorm,
        vec![
            input.into(),
            weight.into(),
            bias.into(),
            mean.into(),
            var.into(),
            Literal::Bool(true).into(),
            Literal::Float(0.1).into(),
            Literal::Float(EPS).into(),
        ],
        "bn",
    );
    graph.add_node(OpKind::GetItem, vec![out.into(), Literal::Int(0).into()], "getitem")
}

/// Annotated float `conv2d -> batch_norm` model as seen before QAT training.
pub fn float_model(channels: usize, with_bias: bool) -> Graph {
    let mut g = Graph::new();
    let x = g.placeholder("x");
    g.meta.entry(x).tensor = Some(TensorMeta::f32([1, IN_CHANNELS, SPATIAL, SPATIAL]));
    let p = load_params(&mut g, channels, with_bias);

    let mut operands = vec![x.into(), p.weight.into(), Operand::from(p.bias)];
    operands.extend(conv_literals());
    let conv = g.add_node(OpKind::Convolution, operands, "conv");
    let out = batch_norm(&mut g, conv, p.bn);
    g.outputs = vec![out];

    let mut ann = QuantAnnotation::new()
        .with_input(x, QuantSpec::activation(0.02, 0))
        .with_input(p.weight, QuantSpec::weight(0.01));
    if let Some(bias) = p.bias {
        ann.insert_input(bias, QuantSpec::bias(0.0002));
    }
    g.meta.set_annotation(conv, ann);
    g.meta.entry(conv).stack_trace = Some("model.conv".into());
    g.meta
        .set_annotation(out, QuantAnnotation::new().with_output(QuantSpec::activation(0.05, 0)));
    g
}

fn per_tensor_qdq(
    graph: &mut Graph,
    kind: OpKind,
    input: NodeId,
    scale: f64,
    range: (i64, i64),
    name: &str,
) -> NodeId {
    graph.add_node(
        kind,
        vec![
            input.into(),
            Literal::Float(scale).into(),
            Literal::Int(0).into(),
            Literal::Int(range.0).into(),
            Literal::Int(range.1).into(),
            Literal::Dtype(Scalar::I8).into(),
        ],
        name,
    )
}

/// Converted QAT model: the training-time conv + batch norm block wrapped in
/// explicit quantize / dequantize operators with `Packet` overloads.
pub fn converted_model(channels: usize, with_bias: bool, per_channel: bool) -> Graph {
    const ACTIVATION: (i64, i64) = (-128, 127);
    const WEIGHT: (i64, i64) = (-127, 127);

    let mut g = Graph::new();
    let x = g.placeholder("x");
    let p = load_params(&mut g, channels, with_bias);
    let [bn_w, _, _, bn_var] = p.bn;

    let var_eps = g.add_node(OpKind::Add, vec![bn_var.into(), Literal::Float(EPS).into()], "add");
    let std = g.add_node(OpKind::Sqrt, vec![var_eps.into()], "sqrt");
    let scale = g.add_node(OpKind::Div, vec![bn_w.into(), std.into()], "div");
    let scale_w = g.add_node(
        OpKind::Reshape,
        vec![scale.into(), Literal::Ints(vec![-1, 1, 1, 1]).into()],
        "reshape",
    );
    let scaled = g.add_node(OpKind::Mul, vec![p.weight.into(), scale_w.into()], "mul");

    let dq_x = per_tensor_qdq(
        &mut g,
        OpKind::DequantizePerTensor(Overload::Packet),
        x,
        0.02,
        ACTIVATION,
        "dequantize",
    );
    let zero_bias = p.bias.map(|b| {
        g.add_node(
            OpKind::ZerosLike,
            vec![b.into(), Literal::Dtype(Scalar::F32).into()],
            "zeros_like",
        )
    });
    let dq_w = if per_channel {
        let scales = g.add_constant("conv.weight_scale", ramp(&[channels], 8, 0.005, 0.015));
        let zero_points = g.add_constant("conv.weight_zero_point", ArrayD::zeros(IxDyn(&[channels])));
        let operands = |input: NodeId| -> Vec<Operand> {
            vec![
                input.into(),
                scales.into(),
                zero_points.into(),
                Literal::Int(0).into(),
                Literal::Int(WEIGHT.0).into(),
                Literal::Int(WEIGHT.1).into(),
                Literal::Dtype(Scalar::I8).into(),
            ]
        };
        let q = g.add_node(OpKind::QuantizePerChannel(Overload::Packet), operands(scaled), "quantize");
        g.add_node(OpKind::DequantizePerChannel(Overload::Packet), operands(q), "dequantize")
    } else {
        let q = per_tensor_qdq(
            &mut g,
            OpKind::QuantizePerTensor(Overload::Packet),
            scaled,
            0.01,
            WEIGHT,
            "quantize",
        );
        per_tensor_qdq(
            &mut g,
            OpKind::DequantizePerTensor(Overload::Packet),
            q,
            0.01,
            WEIGHT,
            "dequantize",
        )
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
    if let Some(b) = p.bias {
        let b = g.add_node(
            OpKind::Reshape,
            vec![b.into(), Literal::Ints(vec![1, -1, 1, 1]).into()],
            "reshape",
        );
        y = g.add_node(OpKind::Add, vec![y.into(), b.into()], "add");
    }
    let out = batch_norm(&mut g, y, p.bn);
    let q_out = per_tensor_qdq(
        &mut g,
        OpKind::QuantizePerTensor(Overload::Packet),
        out,
        0.05,
        ACTIVATION,
        "quantize",
    );
    g.outputs = vec![q_out];

    g.meta.set_annotation(
        conv,
        QuantAnnotation::new()
            .with_input(dq_x, QuantSpec::activation(0.02, 0))
            .with_input(dq_w, QuantSpec::weight(0.01)),
    );
    g
}
