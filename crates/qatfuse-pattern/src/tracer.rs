//! Lowering of reference computations into operator graphs.
//!
//! A [`ReferenceComputation`] describes a small forward computation in terms
//! of the high-level operations on [`TraceContext`]. A [`Tracer`] turns it into
//! a [`Graph`] with one placeholder per input and a single output.

use qatfuse_ir::{Graph, Literal, NodeId, OpKind, Operand, Overload, Scalar, TensorMeta};

use crate::config::QuantBounds;
use crate::error::TraceError;

/// A value recorded while tracing.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct TracedValue(NodeId);

impl TracedValue {
    pub(crate) fn from_node(id: NodeId) -> Self {
        Self(id)
    }

    /// Graph node producing this value.
    pub fn node(self) -> NodeId {
        self.0
    }
}

impl From<TracedValue> for Operand {
    fn from(value: TracedValue) -> Self {
        Operand::Node(value.0)
    }
}

/// A computation that can be traced into a graph.
///
/// Implementors are plain data: everything the computation depends on is fixed
/// at construction.
pub trait ReferenceComputation {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Placeholder names, in input order.
    fn input_names(&self) -> Vec<&'static str>;

    /// Shape / dtype of each input, used when tracing.
    fn example_inputs(&self) -> Vec<TensorMeta>;

    /// Records the computation and returns its result.
    fn build(
        &self,
        cx: &mut TraceContext<'_>,
        inputs: &[TracedValue],
    ) -> Result<TracedValue, TraceError>;
}

/// Lowers a reference computation into a graph.
pub trait Tracer {
    fn trace(
        &self,
        reference: &dyn ReferenceComputation,
        example_inputs: &[TensorMeta],
    ) -> Result<Graph, TraceError>;
}

/// Default tracer: records into a fresh graph, then runs dead-code
/// elimination and commits it.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphTracer;

impl Tracer for GraphTracer {
    fn trace(
        &self,
        reference: &dyn ReferenceComputation,
        example_inputs: &[TensorMeta],
    ) -> Result<Graph, TraceError> {
        let names = reference.input_names();
        if names.len() != example_inputs.len() {
            return Err(TraceError::ArityMismatch {
                reference: reference.name().to_string(),
                expected: names.len(),
                got: example_inputs.len(),
            });
        }

        let mut graph = Graph::new();
        let inputs: Vec<TracedValue> = names
            .iter()
            .zip(example_inputs)
            .map(|(name, meta)| {
                let id = graph.placeholder(name);
                graph.meta.entry(id).tensor = Some(meta.clone());
                TracedValue(id)
            })
            .collect();

        let output = {
            let mut cx = TraceContext::new(&mut graph);
            reference.build(&mut cx, &inputs)?
        };
        graph.outputs = vec![output.node()];
        graph.eliminate_dead_code();
        graph.commit()?;

        log::debug!(
            "traced '{}' into {} node(s)",
            reference.name(),
            graph.node_count()
        );
        Ok(graph)
    }
}

/// Recording surface handed to [`ReferenceComputation::build`].
///
/// Every method appends nodes from the closed operator set.
pub struct TraceContext<'g> {
    graph: &'g mut Graph,
}

impl<'g> TraceContext<'g> {
    pub fn new(graph: &'g mut Graph) -> Self {
        Self { graph }
    }

    fn emit(&mut self, kind: OpKind, operands: Vec<Operand>) -> TracedValue {
        let name = kind.short_name().to_string();
        TracedValue(self.graph.add_node(kind, operands, &name))
    }

    /// Rank of a value whose shape was recorded (graph inputs).
    pub fn rank(&self, value: TracedValue) -> Result<usize, TraceError> {
        self.graph
            .meta
            .get(value.node())
            .and_then(|m| m.tensor.as_ref())
            .map(TensorMeta::rank)
            .ok_or(TraceError::UnknownShape(value.node()))
    }

    /// 2-D convolution with unit stride and dilation, no padding, one group.
    pub fn conv2d(
        &mut self,
        input: TracedValue,
        weight: TracedValue,
        bias: Option<TracedValue>,
    ) -> TracedValue {
        self.emit(
            OpKind::Convolution,
            vec![
                input.into(),
                weight.into(),
                bias.map_or(Operand::None, Operand::from),
                Literal::Ints(vec![1, 1]).into(),
                Literal::Ints(vec![0, 0]).into(),
                Literal::Ints(vec![1, 1]).into(),
                Literal::Bool(false).into(),
                Literal::Ints(vec![0, 0]).into(),
                Literal::Int(1).into(),
            ],
        )
    }

    /// Training-mode batch norm; returns element 0 of the result tuple.
    #[allow(clippy::too_many_arguments)]
    pub fn batch_norm_training(
        &mut self,
        input: TracedValue,
        weight: TracedValue,
        bias: TracedValue,
        running_mean: TracedValue,
        running_var: TracedValue,
        momentum: f64,
        eps: f64,
    ) -> TracedValue {
        let bn = self.emit(
            OpKind::NativeBatchNorm,
            vec![
                input.into(),
                weight.into(),
                bias.into(),
                running_mean.into(),
                running_var.into(),
                Literal::Bool(true).into(),
                Literal::Float(momentum).into(),
                Literal::Float(eps).into(),
            ],
        );
        self.emit(OpKind::GetItem, vec![bn.into(), Literal::Int(0).into()])
    }

    pub fn add(&mut self, lhs: TracedValue, rhs: TracedValue) -> TracedValue {
        self.emit(OpKind::Add, vec![lhs.into(), rhs.into()])
    }

    pub fn add_scalar(&mut self, lhs: TracedValue, rhs: f64) -> TracedValue {
        self.emit(OpKind::Add, vec![lhs.into(), Literal::Float(rhs).into()])
    }

    pub fn sub(&mut self, lhs: TracedValue, rhs: TracedValue) -> TracedValue {
        self.emit(OpKind::Sub, vec![lhs.into(), rhs.into()])
    }

    pub fn mul(&mut self, lhs: TracedValue, rhs: TracedValue) -> TracedValue {
        self.emit(OpKind::Mul, vec![lhs.into(), rhs.into()])
    }

    pub fn div(&mut self, lhs: TracedValue, rhs: TracedValue) -> TracedValue {
        self.emit(OpKind::Div, vec![lhs.into(), rhs.into()])
    }

    pub fn sqrt(&mut self, x: TracedValue) -> TracedValue {
        self.emit(OpKind::Sqrt, vec![x.into()])
    }

    pub fn reshape(&mut self, x: TracedValue, shape: Vec<i64>) -> TracedValue {
        self.emit(OpKind::Reshape, vec![x.into(), Literal::Ints(shape).into()])
    }

    /// Zeros shaped like `x`, as `f32`.
    pub fn zeros_like(&mut self, x: TracedValue) -> TracedValue {
        self.emit(
            OpKind::ZerosLike,
            vec![x.into(), Literal::Dtype(Scalar::F32).into()],
        )
    }

    fn bounds_operands(bounds: QuantBounds) -> [Operand; 3] {
        [
            Literal::Int(bounds.quant_min).into(),
            Literal::Int(bounds.quant_max).into(),
            Literal::Dtype(bounds.dtype).into(),
        ]
    }

    /// Per-tensor quantize with tensor-valued scale / zero point.
    pub fn quantize_per_tensor(
        &mut self,
        x: TracedValue,
        scale: TracedValue,
        zero_point: TracedValue,
        bounds: QuantBounds,
    ) -> TracedValue {
        let mut operands = vec![x.into(), scale.into(), zero_point.into()];
        operands.extend(Self::bounds_operands(bounds));
        self.emit(OpKind::QuantizePerTensor(Overload::Tensor), operands)
    }

    /// Per-tensor dequantize with tensor-valued scale / zero point.
    pub fn dequantize_per_tensor(
        &mut self,
        x: TracedValue,
        scale: TracedValue,
        zero_point: TracedValue,
        bounds: QuantBounds,
    ) -> TracedValue {
        let mut operands = vec![x.into(), scale.into(), zero_point.into()];
        operands.extend(Self::bounds_operands(bounds));
        self.emit(OpKind::DequantizePerTensor(Overload::Tensor), operands)
    }

    pub fn quantize_per_channel(
        &mut self,
        x: TracedValue,
        scales: TracedValue,
        zero_points: TracedValue,
        axis: usize,
        bounds: QuantBounds,
    ) -> TracedValue {
        let mut operands = vec![
            x.into(),
            scales.into(),
            zero_points.into(),
            Literal::Int(axis as i64).into(),
        ];
        operands.extend(Self::bounds_operands(bounds));
        self.emit(OpKind::QuantizePerChannel(Overload::Default), operands)
    }

    pub fn dequantize_per_channel(
        &mut self,
        x: TracedValue,
        scales: TracedValue,
        zero_points: TracedValue,
        axis: usize,
        bounds: QuantBounds,
    ) -> TracedValue {
        let mut operands = vec![
            x.into(),
            scales.into(),
            zero_points.into(),
            Literal::Int(axis as i64).into(),
        ];
        operands.extend(Self::bounds_operands(bounds));
        self.emit(OpKind::DequantizePerChannel(Overload::Default), operands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `sqrt(x) + y`, plus a dead multiply.
    struct SqrtAdd;

    impl ReferenceComputation for SqrtAdd {
        fn name(&self) -> &str {
            "sqrt_add"
        }

        fn input_names(&self) -> Vec<&'static str> {
            vec!["x", "y"]
        }

        fn example_inputs(&self) -> Vec<TensorMeta> {
            vec![TensorMeta::f32([2, 3]), TensorMeta::f32([3])]
        }

        fn build(
            &self,
            cx: &mut TraceContext<'_>,
            inputs: &[TracedValue],
        ) -> Result<TracedValue, TraceError> {
            let [x, y] = inputs else {
                unreachable!("two inputs")
            };
            let _dead = cx.mul(*x, *x);
            assert_eq!(cx.rank(*x)?, 2);
            let s = cx.sqrt(*x);
            Ok(cx.add(s, *y))
        }
    }

    #[test]
    fn trace_records_placeholders_and_output() {
        let reference = SqrtAdd;
        let graph = GraphTracer
            .trace(&reference, &reference.example_inputs())
            .unwrap();
        // dead multiply removed
        assert_eq!(graph.node_count(), 4);
        let placeholders = graph.placeholders();
        assert_eq!(placeholders.len(), 2);
        assert_eq!(graph.node(placeholders[0]).unwrap().name, "x");
        assert_eq!(
            graph.meta.get(placeholders[1]).unwrap().tensor,
            Some(TensorMeta::f32([3]))
        );
        let out = graph.node(graph.outputs[0]).unwrap();
        assert_eq!(out.kind, OpKind::Add);
        assert!(!graph.is_dirty());
    }

    #[test]
    fn trace_rejects_wrong_arity() {
        let err = GraphTracer
            .trace(&SqrtAdd, &[TensorMeta::f32([1])])
            .unwrap_err();
        assert_eq!(
            err,
            TraceError::ArityMismatch {
                reference: "sqrt_add".into(),
                expected: 2,
                got: 1,
            }
        );
    }

    #[test]
    fn rank_of_intermediate_is_unknown() {
        let mut graph = Graph::new();
        let x = graph.placeholder("x");
        let mut cx = TraceContext::new(&mut graph);
        let s = cx.sqrt(TracedValue(x));
        assert_eq!(cx.rank(s), Err(TraceError::UnknownShape(s.node())));
    }

    #[test]
    fn conv2d_uses_default_literals() {
        let mut graph = Graph::new();
        let x = TracedValue(graph.placeholder("x"));
        let w = TracedValue(graph.placeholder("w"));
        let mut cx = TraceContext::new(&mut graph);
        let conv = cx.conv2d(x, w, None);
        let node = graph.node(conv.node()).unwrap();
        assert_eq!(node.operands.len(), 9);
        assert!(node.operands[2].is_none());
        assert_eq!(node.operands[8], Operand::Literal(Literal::Int(1)));
    }
}
