use ndarray::{ArrayD, IxDyn};
use proptest::prelude::*;
use qatfuse_ir::{
    Graph, Literal, NodeId, OpKind, Operand, Overload, QuantAnnotation, QuantSpec, Scalar, Tensor,
};
use qatfuse_pattern::WeightQuantization;

#[allow(dead_code)]
pub const EPS: f64 = 1e-5;

/// Parameters of one conv + batch norm block.
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub struct ConvBn {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub bn_weight: Tensor,
    pub bn_bias: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
}

impl ConvBn {
    #[allow(dead_code)]
    pub fn channels(&self) -> usize {
        self.weight.shape()[0]
    }

    #[allow(dead_code)]
    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Deterministic block with a `kernel x kernel` convolution.
    #[allow(dead_code)]
    pub fn fixed(in_channels: usize, channels: usize, kernel: usize, with_bias: bool, seed: usize) -> Self {
        Self {
            weight: ramp(&[channels, in_channels, kernel, kernel], seed, -0.5, 0.5),
            bias: with_bias.then(|| ramp(&[channels], seed + 1, -0.3, 0.3)),
            bn_weight: ramp(&[channels], seed + 2, 0.5, 1.5),
            bn_bias: ramp(&[channels], seed + 3, -0.4, 0.4),
            running_mean: ramp(&[channels], seed + 4, -0.2, 0.2),
            running_var: ramp(&[channels], seed + 5, 0.5, 2.0),
        }
    }
}

#[allow(dead_code)]
/// Deterministic values in `[lo, hi)` in row-major order.
pub fn ramp(shape: &[usize], seed: usize, lo: f32, hi: f32) -> Tensor {
    let mut i = 0;
    ArrayD::from_shape_fn(IxDyn(shape), |_| {
        let t = ((i * 7 + seed * 13) % 19) as f32 / 19.0;
        i += 1;
        lo + (hi - lo) * t
    })
}

fn tensor(shape: &[usize], values: Vec<f32>) -> Tensor {
    ArrayD::from_shape_vec(IxDyn(shape), values).expect("shape matches data")
}

/// Random conv + batch norm blocks with a 2x2 kernel.
#[allow(dead_code)]
pub fn conv_bn_strategy(with_bias: bool) -> impl Strategy<Value = ConvBn> {
    (1usize..4, 1usize..3).prop_flat_map(move |(c, ic)| {
        (
            prop::collection::vec(-1.0f32..1.0, c * ic * 4),
            prop::collection::vec(-1.0f32..1.0, c),
            prop::collection::vec(0.25f32..2.0, c),
            prop::collection::vec(-1.0f32..1.0, c),
            prop::collection::vec(-0.5f32..0.5, c),
            prop::collection::vec(0.1f32..3.0, c),
        )
            .prop_map(move |(w, b, bn_w, bn_b, mean, var)| ConvBn {
                weight: tensor(&[c, ic, 2, 2], w),
                bias: with_bias.then(|| tensor(&[c], b)),
                bn_weight: tensor(&[c], bn_w),
                bn_bias: tensor(&[c], bn_b),
                running_mean: tensor(&[c], mean),
                running_var: tensor(&[c], var),
            })
    })
}

/// Random input of shape `[1, in_channels, 4, 4]`.
#[allow(dead_code)]
pub fn input_strategy(in_channels: usize) -> impl Strategy<Value = ArrayD<f32>> {
    prop::collection::vec(-2.0f32..2.0, in_channels * 16)
        .prop_map(move |v| tensor(&[1, in_channels, 4, 4], v))
}

#[allow(dead_code)]
pub fn conv_literals() -> Vec<Operand> {
    vec![
        Literal::Ints(vec![1, 1]).into(),
        Literal::Ints(vec![0, 0]).into(),
        Literal::Ints(vec![1, 1]).into(),
        Literal::Bool(false).into(),
        Literal::Ints(vec![0, 0]).into(),
        Literal::Int(1).into(),
    ]
}

#[allow(dead_code)]
/// Constant nodes of one block, loaded under `prefix`.
pub struct Loaded {
    pub weight: NodeId,
    pub bias: Option<NodeId>,
    pub bn: [NodeId; 4],
}

fn load(graph: &mut Graph, prefix: &str, block: &ConvBn) -> Loaded {
    let weight = graph.add_constant(&format!("{prefix}.conv.weight"), block.weight.clone());
    let bias = block
        .bias
        .as_ref()
        .map(|b| graph.add_constant(&format!("{prefix}.conv.bias"), b.clone()));
    let bn = [
        graph.add_constant(&format!("{prefix}.bn.weight"), block.bn_weight.clone()),
        graph.add_constant(&format!("{prefix}.bn.bias"), block.bn_bias.clone()),
        graph.add_constant(&format!("{prefix}.bn.running_mean"), block.running_mean.clone()),
        graph.add_constant(&format!("{prefix}.bn.running_var"), block.running_var.clone()),
    ];
    Loaded { weight, bias, bn }
}

#[allow(dead_code)]
/// `getitem(batch_norm_training(input), 0)`.
pub fn batch_norm(graph: &mut Graph, input: NodeId, bn: [NodeId; 4], eps: f64) -> NodeId {
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
            Literal::Float(eps).into(),
        ],
        "bn",
    );
    graph.add_node(OpKind::GetItem, vec![out.into(), Literal::Int(0).into()], "getitem")
}

#[allow(dead_code)]
/// Appends an annotated float conv + batch norm block fed by `input`.
pub fn append_float_block(graph: &mut Graph, input: NodeId, prefix: &str, block: &ConvBn, eps: f64) -> NodeId {
    let p = load(graph, prefix, block);
    let mut operands = vec![input.into(), p.weight.into(), Operand::from(p.bias)];
    operands.extend(conv_literals());
    let conv = graph.add_node(OpKind::Convolution, operands, "conv");
    let out = batch_norm(graph, conv, p.bn, eps);

    let mut ann = QuantAnnotation::new()
        .with_input(input, QuantSpec::activation(0.05, 0))
        .with_input(p.weight, QuantSpec::weight(0.01));
    if let Some(b) = p.bias {
        ann.insert_input(b, QuantSpec::bias(0.0005));
    }
    graph.meta.set_annotation(conv, ann);
    graph.meta.entry(conv).stack_trace = Some(format!("{prefix}.conv"));
    out
}

#[allow(dead_code)]
/// A float model chaining `blocks` one after another.
pub fn float_model(blocks: &[ConvBn], eps: f64) -> Graph {
    let mut g = Graph::new();
    let mut y = g.placeholder("x");
    for (i, block) in blocks.iter().enumerate() {
        y = append_float_block(&mut g, y, &format!("b{i}"), block, eps);
    }
    g.outputs = vec![y];
    g.commit().expect("valid float model");
    g
}

fn per_tensor_qdq(graph: &mut Graph, kind: OpKind, input: NodeId, scale: f64, range: (i64, i64)) -> NodeId {
    let name = if kind.is_quantize() { "quantize" } else { "dequantize" };
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

/// A converted QAT block with `overload` q/dq operators, as emitted by
/// convert after training-time fusion. Per-channel weight scales are loaded
/// as `{prefix}.conv.weight_scale`.
#[allow(dead_code)]
pub fn converted_model(block: &ConvBn, weight_quant: WeightQuantization, overload: Overload) -> Graph {
    const ACTIVATION: (i64, i64) = (-128, 127);
    const WEIGHT: (i64, i64) = (-127, 127);
    let prefix = "b0";
    let channels = block.channels();

    let mut g = Graph::new();
    let x = g.placeholder("x");
    let p = load(&mut g, prefix, block);
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

    let dq_x = per_tensor_qdq(&mut g, OpKind::DequantizePerTensor(overload), x, 0.05, ACTIVATION);
    let zero_bias = p.bias.map(|b| {
        g.add_node(
            OpKind::ZerosLike,
            vec![b.into(), Literal::Dtype(Scalar::F32).into()],
            "zeros_like",
        )
    });
    let dq_w = match weight_quant {
        WeightQuantization::PerTensor => {
            let q = per_tensor_qdq(&mut g, OpKind::QuantizePerTensor(overload), scaled, 0.01, WEIGHT);
            per_tensor_qdq(&mut g, OpKind::DequantizePerTensor(overload), q, 0.01, WEIGHT)
        }
        WeightQuantization::PerChannel => {
            let scales = g.add_constant(&format!("{prefix}.conv.weight_scale"), ramp(&[channels], 9, 0.005, 0.02));
            let zero_points = g.add_constant(
                &format!("{prefix}.conv.weight_zero_point"),
                ArrayD::zeros(IxDyn(&[channels])),
            );
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
            let q = g.add_node(OpKind::QuantizePerChannel(overload), operands(scaled), "quantize");
            g.add_node(OpKind::DequantizePerChannel(overload), operands(q), "dequantize")
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
    if let Some(b) = p.bias {
        let b = g.add_node(
            OpKind::Reshape,
            vec![b.into(), Literal::Ints(vec![1, -1, 1, 1]).into()],
            "reshape",
        );
        y = g.add_node(OpKind::Add, vec![y.into(), b.into()], "add");
    }
    let out = batch_norm(&mut g, y, p.bn, EPS);
    let q_out = per_tensor_qdq(&mut g, OpKind::QuantizePerTensor(overload), out, 0.1, ACTIVATION);
    g.outputs = vec![q_out];
    g.meta.set_annotation(
        conv,
        QuantAnnotation::new()
            .with_input(dq_x, QuantSpec::activation(0.05, 0))
            .with_input(dq_w, QuantSpec::weight(0.01)),
    );
    g.commit().expect("valid converted model");
    g
}

#[allow(dead_code)]
/// Single-output forward pass through the reference interpreter.
pub fn forward(graph: &Graph, input: &ArrayD<f32>) -> ArrayD<f64> {
    let mut out = qatfuse_kernels::evaluate(graph, std::slice::from_ref(input)).expect("evaluation failed");
    assert_eq!(out.len(), 1);
    out.remove(0)
}

#[allow(dead_code)]
pub fn count(graph: &Graph, pred: impl Fn(&OpKind) -> bool) -> usize {
    graph.nodes().iter().filter(|n| pred(&n.kind)).count()
}

#[allow(dead_code)]
/// Every annotation key names a live operand of the annotated node.
pub fn assert_no_dangling_annotations(graph: &Graph) {
    for (id, meta) in graph.meta.iter() {
        let node = graph.node(id).unwrap_or_else(|| panic!("metadata for dead node {id}"));
        if let Some(ann) = &meta.quantization {
            for key in ann.input_keys() {
                assert!(node.uses(key), "{} annotates {key}, which it does not use", node.name);
            }
        }
    }
    graph.validate().expect("graph validates");
}

/// Name of the constant loaded by the `index`-th operand of `node`.
#[allow(dead_code)]
pub fn constant_operand<'g>(graph: &'g Graph, node: NodeId, index: usize) -> Option<&'g str> {
    let id = graph.node(node)?.operand(index)?.as_node()?;
    match &graph.node(id)?.kind {
        OpKind::GetAttr { target } => Some(target.as_str()),
        _ => None,
    }
}

/// Closed-form conv weight and bias after absorbing the batch norm, in f64.
#[allow(dead_code)]
pub fn folded_closed_form(block: &ConvBn, eps: f64) -> (ArrayD<f64>, Vec<f64>) {
    let wide = |t: &Tensor| -> Vec<f64> { t.iter().map(|&v| f64::from(v)).collect() };
    let (bn_w, bn_b) = (wide(&block.bn_weight), wide(&block.bn_bias));
    let (mean, var) = (wide(&block.running_mean), wide(&block.running_var));
    let bias = block.bias.as_ref().map(wide);

    let scale: Vec<f64> = bn_w.iter().zip(&var).map(|(w, v)| w / (v + eps).sqrt()).collect();
    let mut weight = block.weight.mapv(f64::from);
    for (c, mut row) in weight.outer_iter_mut().enumerate() {
        row.mapv_inplace(|w| w * scale[c]);
    }
    let bias = (0..block.channels())
        .map(|c| {
            let b = bias.as_ref().map_or(0.0, |b| b[c]);
            (b - mean[c]) * scale[c] + bn_b[c]
        })
        .collect();
    (weight, bias)
}

/// Asserts `actual` equals `expected` within `rel` relative tolerance.
#[allow(dead_code)]
pub fn assert_close(actual: impl IntoIterator<Item = f64>, expected: impl IntoIterator<Item = f64>, rel: f64) {
    let actual: Vec<f64> = actual.into_iter().collect();
    let expected: Vec<f64> = expected.into_iter().collect();
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(&expected).enumerate() {
        assert!(
            (a - e).abs() <= rel * e.abs().max(1.0),
            "element {i}: {a} vs {e}"
        );
    }
}
