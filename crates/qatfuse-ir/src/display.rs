//! Display implementations and text dump for debugging.

use std::fmt;

use crate::graph::{Graph, Literal, Node, NodeId, OpKind, Operand, Overload};
use crate::meta::{QuantAnnotation, QuantGranularity, QuantSpec};
use crate::types::{Scalar, ScalarKind, TensorMeta};

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Sint => write!(f, "sint"),
            Self::Uint => write!(f, "uint"),
            Self::Float => write!(f, "float"),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Bool => write!(f, "bool"),
            ScalarKind::Sint => write!(f, "i{}", self.width * 8),
            ScalarKind::Uint => write!(f, "u{}", self.width * 8),
            ScalarKind::Float => write!(f, "f{}", self.width * 8),
        }
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.scalar, self.shape)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for Overload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Tensor => write!(f, "tensor"),
            Self::Packet => write!(f, "packet"),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetAttr { target } => write!(f, "get_attr[{target}]"),
            other => match other.overload() {
                Some(o) => write!(f, "{}.{o}", other.short_name()),
                None => write!(f, "{}", other.short_name()),
            },
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Ints(v) => write!(f, "{v:?}"),
            Self::Dtype(s) => write!(f, "{s}"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{id}"),
            Self::Literal(lit) => write!(f, "{lit}"),
            Self::None => write!(f, "None"),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} = {}(", self.id, self.name, self.kind)?;
        for (i, operand) in self.operands.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{operand}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for QuantSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.granularity {
            QuantGranularity::PerTensor => write!(
                f,
                "{}[{}, {}] scale={} zp={}",
                self.dtype,
                self.quant_min,
                self.quant_max,
                self.scale.first().copied().unwrap_or_default(),
                self.zero_point.first().copied().unwrap_or_default(),
            ),
            QuantGranularity::PerChannel { axis } => write!(
                f,
                "{}[{}, {}] axis={axis} channels={}",
                self.dtype,
                self.quant_min,
                self.quant_max,
                self.scale.len(),
            ),
        }
    }
}

impl fmt::Display for QuantAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, spec)) in self.inputs().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}: {spec}")?;
        }
        if let Some(out) = &self.output_qspec {
            write!(f, "; out: {out}")?;
        }
        write!(f, "}}")
    }
}

/// Renders a graph as human-readable text.
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::new();

    if !graph.constants.is_empty() {
        out.push_str("Constants:\n");
        for (name, value) in &graph.constants {
            out.push_str(&format!("  {name}: f32{:?}\n", value.shape()));
        }
        out.push('\n');
    }

    out.push_str("Nodes:\n");
    for node in graph.nodes() {
        out.push_str(&format!("  {node}"));
        if let Some(tensor) = graph.meta.get(node.id).and_then(|m| m.tensor.as_ref()) {
            out.push_str(&format!(" : {tensor}"));
        }
        out.push('\n');
        if let Some(ann) = graph.meta.annotation(node.id) {
            out.push_str(&format!("      quant {ann}\n"));
        }
    }

    let outputs: Vec<String> = graph.outputs.iter().map(|o| o.to_string()).collect();
    out.push_str(&format!("\nOutputs: [{}]\n", outputs.join(", ")));
    out
}
