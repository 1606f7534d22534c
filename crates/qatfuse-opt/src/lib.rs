//! Conv + batch norm QAT fusion passes for qatfuse graphs.
//!
//! Provides a [`Pass`] trait, a [`PassManager`] with fixed-point iteration,
//! the training-stage fusion and convert-stage folding passes, and the
//! functional entry points [`fuse_training`] and [`fold_quantized`].

mod config;
pub mod const_fold;
mod conv_bn;
mod dce;
mod error;
pub mod merge;
mod validation;

#[cfg(test)]
mod testing;

pub use config::FusionConfig;
pub use const_fold::{BatchNormParams, fold_bn_weights_into_conv, fuse_conv_bn_weights};
pub use conv_bn::{
    FoldConvBnQuantized, FuseConvBnTraining, fold_conv_bn_quantized, fuse_conv_bn_training,
};
pub use dce::DeadCodeElimination;
pub use error::FusionError;
pub use merge::copy_over_metadata;
pub use validation::{GraphValidation, orphan_constants};

use std::fmt::Debug;

use qatfuse_ir::Graph;
use qatfuse_pattern::{GraphTracer, OverloadAgnostic, Tracer};

/// A transformation over a graph.
pub trait Pass: Debug {
    /// Human-readable name of the pass.
    fn name(&self) -> &str;

    /// Runs the pass. Returns `true` if anything was modified.
    ///
    /// On error the graph may be partially rewritten.
    fn run(&self, graph: &mut Graph) -> Result<bool, FusionError>;
}

/// Which end of the QAT flow a pipeline serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionStage {
    /// Float graph before QAT training.
    Training,
    /// Converted graph with explicit quantize / dequantize operators.
    Convert,
}

/// Maximum number of fixed-point iterations before giving up.
const MAX_ITERATIONS: usize = 10;

/// Runs passes in sequence with fixed-point iteration.
#[derive(Debug)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PassManager {
    /// Creates an empty pass manager with no passes.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Creates the default pipeline for `stage`.
    pub fn for_stage(stage: FusionStage) -> Self {
        let config = FusionConfig::default();
        let mut pm = Self::new();
        match stage {
            FusionStage::Training => pm.add_pass(Box::new(FuseConvBnTraining::new(config))),
            FusionStage::Convert => pm.add_pass(Box::new(FoldConvBnQuantized::new(config))),
        }
        pm.add_pass(Box::new(DeadCodeElimination));
        pm.add_pass(Box::new(GraphValidation));
        pm
    }

    /// Adds a pass to the pipeline.
    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Runs all passes until a fixed point is reached or the iteration limit.
    ///
    /// Returns the number of rounds that changed the graph.
    pub fn run(&self, graph: &mut Graph) -> Result<usize, FusionError> {
        let mut rounds = 0;
        for _ in 0..MAX_ITERATIONS {
            let mut changed = false;
            for pass in &self.passes {
                if pass.run(graph)? {
                    log::debug!("pass '{}' changed the graph", pass.name());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            rounds += 1;
        }
        Ok(rounds)
    }
}

/// Fuses every conv + batch norm block of a float graph into its QAT form,
/// with the default configuration.
pub fn fuse_training(graph: Graph) -> Result<Graph, FusionError> {
    fuse_training_with(graph, &FusionConfig::default(), &GraphTracer)
}

/// [`fuse_training`] with an explicit configuration and tracer.
pub fn fuse_training_with(
    mut graph: Graph,
    config: &FusionConfig,
    tracer: &dyn Tracer,
) -> Result<Graph, FusionError> {
    fuse_conv_bn_training(&mut graph, config, tracer)?;
    Ok(graph)
}

/// Replaces every quantized QAT conv + batch norm block of a converted graph
/// by a plain quantized convolution with folded constants, with the default
/// configuration.
pub fn fold_quantized(graph: Graph) -> Result<Graph, FusionError> {
    fold_quantized_with(graph, &FusionConfig::default(), &GraphTracer)
}

/// [`fold_quantized`] with an explicit configuration and tracer.
pub fn fold_quantized_with(
    mut graph: Graph,
    config: &FusionConfig,
    tracer: &dyn Tracer,
) -> Result<Graph, FusionError> {
    fold_conv_bn_quantized(&mut graph, config, tracer, &OverloadAgnostic)?;
    Ok(graph)
}
