//! Reference interpreter for qatfuse graphs.
//!
//! Evaluates every node in graph order with `f64` arithmetic. Constant and
//! input tensors are widened from `f32` on load.

use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn, Zip};
use qatfuse_ir::{Graph, Literal, Node, NodeId, OpKind, Operand};

use crate::conv::{Conv2dParams, conv2d};
use crate::error::KernelError;
use crate::norm::batch_norm;
use crate::quant::{
    QuantRange, dequantize_per_channel, dequantize_per_tensor, quantize_per_channel,
    quantize_per_tensor,
};

/// A runtime value produced by a node.
#[derive(Clone, Debug)]
pub enum Value {
    Tensor(ArrayD<f64>),
    /// Multi-result operators (batch norm).
    Tuple(Vec<ArrayD<f64>>),
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let dim = |s: &[usize], i: usize| {
        let offset = rank - s.len();
        if i < offset { 1 } else { s[i - offset] }
    };
    (0..rank)
        .map(|i| match (dim(lhs, i), dim(rhs, i)) {
            (a, b) if a == b => Some(a),
            (1, b) => Some(b),
            (a, 1) => Some(a),
            _ => None,
        })
        .collect()
}

fn broadcast_binary(
    op: &'static str,
    lhs: &ArrayD<f64>,
    rhs: &ArrayD<f64>,
    f: impl Fn(f64, f64) -> f64,
) -> Result<ArrayD<f64>, KernelError> {
    let mismatch = || KernelError::ShapeMismatch {
        op,
        lhs: lhs.shape().to_vec(),
        rhs: rhs.shape().to_vec(),
    };
    let shape = broadcast_shape(lhs.shape(), rhs.shape()).ok_or_else(mismatch)?;
    let a = lhs.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    let b = rhs.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)))
}

/// Resolves a reshape target, allowing one `-1` dimension.
fn resolve_shape(target: &[i64], numel: usize) -> Option<Vec<usize>> {
    let known: i64 = target.iter().filter(|&&d| d != -1).product();
    let inferred = target.iter().filter(|&&d| d == -1).count();
    if target.iter().any(|&d| d < -1) || inferred > 1 {
        return None;
    }
    let dims: Vec<usize> = target
        .iter()
        .map(|&d| {
            if d == -1 {
                if known == 0 { 0 } else { numel / known as usize }
            } else {
                d as usize
            }
        })
        .collect();
    (dims.iter().product::<usize>() == numel).then_some(dims)
}

fn to_usize_pair(values: &[i64]) -> Option<[usize; 2]> {
    match values {
        [a, b] if *a >= 0 && *b >= 0 => Some([*a as usize, *b as usize]),
        [a] if *a >= 0 => Some([*a as usize, *a as usize]),
        _ => None,
    }
}

/// Evaluates a [`Graph`] on concrete inputs.
pub struct Interpreter<'g> {
    graph: &'g Graph,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph }
    }

    /// Runs the graph; `inputs` are bound to placeholders in graph order.
    ///
    /// Returns one tensor per graph output.
    pub fn run(&self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f64>>, KernelError> {
        let placeholders = self.graph.placeholders();
        if placeholders.len() != inputs.len() {
            return Err(KernelError::InputCount {
                expected: placeholders.len(),
                got: inputs.len(),
            });
        }

        let mut values: HashMap<NodeId, Value> = HashMap::with_capacity(self.graph.node_count());
        let mut next_input = inputs.iter();
        for node in self.graph.nodes() {
            let value = match &node.kind {
                OpKind::Placeholder => {
                    let input = next_input.next().ok_or(KernelError::InputCount {
                        expected: placeholders.len(),
                        got: inputs.len(),
                    })?;
                    Value::Tensor(input.mapv(f64::from))
                }
                _ => Frame::new(node, &values).eval(self.graph)?,
            };
            log::trace!("evaluated {} ({})", node.name, node.kind);
            values.insert(node.id, value);
        }

        self.graph
            .outputs
            .iter()
            .map(|id| match values.remove(id) {
                Some(Value::Tensor(t)) => Ok(t),
                Some(Value::Tuple(_)) => Err(KernelError::Unsupported(
                    "tuple-valued graph output".into(),
                )),
                None => Err(KernelError::MissingValue(*id)),
            })
            .collect()
    }
}

/// Convenience wrapper around [`Interpreter::run`].
pub fn evaluate(graph: &Graph, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f64>>, KernelError> {
    Interpreter::new(graph).run(inputs)
}

/// Operand accessors for a single node evaluation.
struct Frame<'a> {
    node: &'a Node,
    values: &'a HashMap<NodeId, Value>,
}

impl<'a> Frame<'a> {
    fn new(node: &'a Node, values: &'a HashMap<NodeId, Value>) -> Self {
        Self { node, values }
    }

    fn bad(&self, index: usize, expected: &'static str) -> KernelError {
        KernelError::BadOperand {
            node: self.node.name.clone(),
            index,
            expected,
        }
    }

    fn operand(&self, index: usize) -> Result<&'a Operand, KernelError> {
        self.node
            .operands
            .get(index)
            .ok_or_else(|| self.bad(index, "present"))
    }

    fn value(&self, id: NodeId) -> Result<&'a Value, KernelError> {
        self.values.get(&id).ok_or(KernelError::MissingValue(id))
    }

    /// Tensor operand; numeric literals become 0-d tensors.
    fn tensor(&self, index: usize) -> Result<ArrayD<f64>, KernelError> {
        match self.operand(index)? {
            Operand::Node(id) => match self.value(*id)? {
                Value::Tensor(t) => Ok(t.clone()),
                Value::Tuple(_) => Err(self.bad(index, "a tensor")),
            },
            Operand::Literal(lit) => lit
                .as_float()
                .map(|v| ArrayD::from_elem(IxDyn(&[]), v))
                .ok_or_else(|| self.bad(index, "a tensor or number")),
            Operand::None => Err(self.bad(index, "a tensor")),
        }
    }

    fn optional_tensor(&self, index: usize) -> Result<Option<ArrayD<f64>>, KernelError> {
        match self.node.operands.get(index) {
            None | Some(Operand::None) => Ok(None),
            Some(_) => self.tensor(index).map(Some),
        }
    }

    fn literal(&self, index: usize) -> Result<&'a Literal, KernelError> {
        self.operand(index)?
            .as_literal()
            .ok_or_else(|| self.bad(index, "a literal"))
    }

    fn int(&self, index: usize) -> Result<i64, KernelError> {
        self.literal(index)?
            .as_int()
            .ok_or_else(|| self.bad(index, "an int"))
    }

    fn float(&self, index: usize) -> Result<f64, KernelError> {
        self.literal(index)?
            .as_float()
            .ok_or_else(|| self.bad(index, "a float"))
    }

    fn bool(&self, index: usize) -> Result<bool, KernelError> {
        self.literal(index)?
            .as_bool()
            .ok_or_else(|| self.bad(index, "a bool"))
    }

    fn pair(&self, index: usize) -> Result<[usize; 2], KernelError> {
        self.literal(index)?
            .as_ints()
            .and_then(to_usize_pair)
            .ok_or_else(|| self.bad(index, "a pair of non-negative ints"))
    }

    /// Scalar parameter given as a literal or a one-element tensor.
    fn scalar(&self, index: usize) -> Result<f64, KernelError> {
        let t = self.tensor(index)?;
        match t.len() {
            1 => t.iter().next().copied().ok_or_else(|| self.bad(index, "a scalar")),
            _ => Err(self.bad(index, "a scalar")),
        }
    }

    fn vector(&self, index: usize) -> Result<Vec<f64>, KernelError> {
        Ok(self.tensor(index)?.iter().copied().collect())
    }

    fn range(&self, min: usize, max: usize) -> Result<QuantRange, KernelError> {
        Ok(QuantRange {
            min: self.int(min)?,
            max: self.int(max)?,
        })
    }

    fn binary(&self, op: &'static str, f: impl Fn(f64, f64) -> f64) -> Result<Value, KernelError> {
        let lhs = self.tensor(0)?;
        let rhs = self.tensor(1)?;
        broadcast_binary(op, &lhs, &rhs, f).map(Value::Tensor)
    }

    fn eval(&self, graph: &Graph) -> Result<Value, KernelError> {
        let tensor = match &self.node.kind {
            OpKind::Placeholder => return Err(KernelError::Unsupported("placeholder".into())),
            OpKind::GetAttr { target } => graph
                .constant(target)
                .map(|c| c.mapv(f64::from))
                .ok_or_else(|| KernelError::MissingConstant(target.clone()))?,
            OpKind::Convolution => {
                if self.bool(6)? {
                    return Err(KernelError::Unsupported("transposed convolution".into()));
                }
                let groups = self.int(8)?;
                let params = Conv2dParams {
                    stride: self.pair(3)?,
                    padding: self.pair(4)?,
                    dilation: self.pair(5)?,
                    groups: usize::try_from(groups).map_err(|_| self.bad(8, "a positive int"))?,
                };
                let bias = self.optional_tensor(2)?;
                conv2d(&self.tensor(0)?, &self.tensor(1)?, bias.as_ref(), &params)?
            }
            OpKind::NativeBatchNorm => {
                let weight = self.optional_tensor(1)?;
                let bias = self.optional_tensor(2)?;
                let out = batch_norm(
                    &self.tensor(0)?,
                    weight.as_ref(),
                    bias.as_ref(),
                    &self.tensor(3)?,
                    &self.tensor(4)?,
                    self.bool(5)?,
                    self.float(7)?,
                )?;
                return Ok(Value::Tuple(vec![
                    out.output,
                    out.save_mean.into_dyn(),
                    out.save_rstd.into_dyn(),
                ]));
            }
            OpKind::GetItem => {
                let index = self.int(1)?;
                let tuple_id = self
                    .operand(0)?
                    .as_node()
                    .ok_or_else(|| self.bad(0, "a node"))?;
                match self.value(tuple_id)? {
                    Value::Tuple(items) => usize::try_from(index)
                        .ok()
                        .and_then(|i| items.get(i))
                        .cloned()
                        .ok_or_else(|| self.bad(1, "a valid tuple index"))?,
                    Value::Tensor(_) => return Err(self.bad(0, "a tuple")),
                }
            }
            OpKind::QuantizePerTensor(_) => quantize_per_tensor(
                &self.tensor(0)?,
                self.scalar(1)?,
                self.scalar(2)?,
                self.range(3, 4)?,
            ),
            OpKind::DequantizePerTensor(_) => {
                dequantize_per_tensor(&self.tensor(0)?, self.scalar(1)?, self.scalar(2)?)
            }
            OpKind::QuantizePerChannel(_) => quantize_per_channel(
                &self.tensor(0)?,
                &self.vector(1)?,
                &self.vector(2)?,
                self.axis(3)?,
                self.range(4, 5)?,
            )?,
            OpKind::DequantizePerChannel(_) => dequantize_per_channel(
                &self.tensor(0)?,
                &self.vector(1)?,
                &self.vector(2)?,
                self.axis(3)?,
            )?,
            OpKind::Add => return self.binary("add", |a, b| a + b),
            OpKind::Sub => return self.binary("sub", |a, b| a - b),
            OpKind::Mul => return self.binary("mul", |a, b| a * b),
            OpKind::Div => return self.binary("div", |a, b| a / b),
            OpKind::Sqrt => self.tensor(0)?.mapv(f64::sqrt),
            OpKind::Reshape => {
                let x = self.tensor(0)?;
                let target = self
                    .literal(1)?
                    .as_ints()
                    .ok_or_else(|| self.bad(1, "an int list"))?;
                let dims = resolve_shape(target, x.len()).ok_or_else(|| KernelError::ShapeMismatch {
                    op: "reshape",
                    lhs: x.shape().to_vec(),
                    rhs: target.iter().map(|&d| d.max(0) as usize).collect(),
                })?;
                ArrayD::from_shape_vec(IxDyn(&dims), x.iter().copied().collect()).map_err(|_| {
                    KernelError::ShapeMismatch {
                        op: "reshape",
                        lhs: x.shape().to_vec(),
                        rhs: dims.clone(),
                    }
                })?
            }
            OpKind::ZerosLike => ArrayD::zeros(self.tensor(0)?.raw_dim()),
            OpKind::Opaque { name } => return Err(KernelError::Unsupported(name.clone())),
        };
        Ok(Value::Tensor(tensor))
    }

    fn axis(&self, index: usize) -> Result<usize, KernelError> {
        usize::try_from(self.int(index)?).map_err(|_| self.bad(index, "a non-negative axis"))
    }
}
