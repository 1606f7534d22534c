//! Pattern builder for conv + batch norm fusion.
//!
//! Reference computations are traced into small operator graphs that serve as
//! match patterns and replacements for the rewriter.

mod config;
mod error;
pub mod ops;
pub mod reference;
pub mod tracer;

pub use config::{PatternConfig, QuantBounds};
pub use error::TraceError;
pub use ops::{
    ExactOverloads, OperatorTable, OverloadAgnostic, canonicalize_graph, canonicalize_graph_recording,
    restore_kinds,
};
pub use reference::{
    ConvBnReference, FoldedQuantizedConvBnReference, QatConvBnReference,
    QuantizedQatConvBnReference, WeightQuantization,
};
pub use tracer::{GraphTracer, ReferenceComputation, TraceContext, TracedValue, Tracer};

/// Traces `reference` with its own example inputs.
pub fn trace_with(
    tracer: &dyn Tracer,
    reference: &dyn ReferenceComputation,
) -> Result<qatfuse_ir::Graph, TraceError> {
    tracer.trace(reference, &reference.example_inputs())
}
