//! qatfuse intermediate representation.
//!
//! An ordered, acyclic dataflow graph of tensor operators with a per-node
//! metadata side-table. The graph is the unit that pattern matching and
//! rewriting operate on: patterns, replacements and user models are all
//! [`Graph`]s.

mod display;
mod error;
pub mod graph;
pub mod meta;
mod types;

pub use display::dump_graph;
pub use error::IrError;
pub use graph::{Graph, Literal, Node, NodeId, OpKind, Operand, Overload, Tensor};
pub use meta::{MetaTable, NodeMeta, QuantAnnotation, QuantGranularity, QuantSpec};
pub use types::{Bytes, Scalar, ScalarKind, TensorMeta};
