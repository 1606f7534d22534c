//! Conv + batch norm fusion passes.
//!
//! The training stage swaps every `conv2d -> batch_norm` block for the
//! scale-folded QAT form; the convert stage swaps the quantized QAT form for
//! a plain quantized conv + batch norm and folds the batch norm away.

use std::fmt::Debug;

use qatfuse_ir::Graph;
use qatfuse_pattern::{
    ConvBnReference, FoldedQuantizedConvBnReference, GraphTracer, OperatorTable, OverloadAgnostic,
    QatConvBnReference, QuantizedQatConvBnReference, Tracer, WeightQuantization, canonicalize_graph,
    canonicalize_graph_recording, restore_kinds, trace_with,
};
use qatfuse_rewrite::{
    MatchFilter, ReplacedPattern, bn_has_scale_inputs, conv_not_transposed, has_conv_bias,
    no_conv_bias, replace_pattern_with_filters,
};

use crate::config::FusionConfig;
use crate::const_fold::fold_bn_weights_into_conv;
use crate::error::FusionError;
use crate::merge::copy_over_metadata;
use crate::Pass;

fn finish(graph: &mut Graph, replaced: &[ReplacedPattern]) -> Result<(), FusionError> {
    if !replaced.is_empty() {
        graph.eliminate_dead_code();
    }
    graph.commit()?;
    Ok(())
}

/// Rewrites every conv + batch norm block of a float training graph into its
/// QAT form.
///
/// Convolutions with a bias and without one are handled by separate
/// replacements, selected by the [`has_conv_bias`] / [`no_conv_bias`]
/// filters. Blocks whose batch norm lacks an affine weight or running
/// variance, and transposed convolutions, are left untouched.
pub fn fuse_conv_bn_training(
    graph: &mut Graph,
    config: &FusionConfig,
    tracer: &dyn Tracer,
) -> Result<Vec<ReplacedPattern>, FusionError> {
    let patterns = &config.patterns;
    let pattern = trace_with(
        tracer,
        &ConvBnReference {
            config: patterns.clone(),
        },
    )?;
    let branches: [(bool, MatchFilter); 2] = [(true, has_conv_bias), (false, no_conv_bias)];

    let mut replaced = Vec::new();
    for (with_bias, filter) in branches {
        let replacement = trace_with(tracer, &QatConvBnReference::new(with_bias, patterns.clone()))?;
        replaced.extend(replace_pattern_with_filters(
            graph,
            &pattern,
            &replacement,
            &[filter, bn_has_scale_inputs, conv_not_transposed],
            config.ignore_literals,
        )?);
    }
    for r in &replaced {
        copy_over_metadata(graph, r)?;
    }
    finish(graph, &replaced)?;

    log::info!("fused {} conv + batch norm block(s) for QAT", replaced.len());
    Ok(replaced)
}

/// Replaces every quantized QAT conv + batch norm block of a converted graph
/// and folds the batch norm into the convolution constants.
///
/// Patterns, replacements and the target are all canonicalized through
/// `operators` before matching, so q/dq overloads in the target need not
/// match those the patterns were traced with. Target nodes that survive the
/// rewrite get their original kinds back; inserted nodes keep the canonical
/// kinds.
pub fn fold_conv_bn_quantized(
    graph: &mut Graph,
    config: &FusionConfig,
    tracer: &dyn Tracer,
    operators: &dyn OperatorTable,
) -> Result<Vec<ReplacedPattern>, FusionError> {
    let originals = canonicalize_graph_recording(graph, operators);
    let result = fold_canonical(graph, config, tracer, operators);
    restore_kinds(graph, originals);
    let all = result?;
    finish(graph, &all)?;

    log::info!("folded {} quantized conv + batch norm block(s)", all.len());
    Ok(all)
}

fn fold_canonical(
    graph: &mut Graph,
    config: &FusionConfig,
    tracer: &dyn Tracer,
    operators: &dyn OperatorTable,
) -> Result<Vec<ReplacedPattern>, FusionError> {
    let patterns = &config.patterns;
    let mut all = Vec::new();
    for weight_quant in [WeightQuantization::PerChannel, WeightQuantization::PerTensor] {
        for with_bias in [true, false] {
            let mut pattern = trace_with(
                tracer,
                &QuantizedQatConvBnReference::new(weight_quant, with_bias, patterns.clone()),
            )?;
            let mut replacement = trace_with(
                tracer,
                &FoldedQuantizedConvBnReference::new(weight_quant, with_bias, patterns.clone()),
            )?;
            canonicalize_graph(&mut pattern, operators);
            canonicalize_graph(&mut replacement, operators);

            let replaced = replace_pattern_with_filters(
                graph,
                &pattern,
                &replacement,
                &[],
                config.ignore_literals,
            )?;
            for r in &replaced {
                copy_over_metadata(graph, r)?;
                fold_bn_weights_into_conv(graph, r)?;
            }
            log::debug!(
                "{weight_quant:?} weights, bias {with_bias}: {} block(s)",
                replaced.len()
            );
            all.extend(replaced);
        }
    }
    Ok(all)
}

/// Training-stage pass wrapping [`fuse_conv_bn_training`].
#[derive(Clone, Debug)]
pub struct FuseConvBnTraining<T = GraphTracer> {
    pub config: FusionConfig,
    pub tracer: T,
}

impl FuseConvBnTraining {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            tracer: GraphTracer,
        }
    }
}

impl<T: Tracer + Debug> Pass for FuseConvBnTraining<T> {
    fn name(&self) -> &str {
        "fuse-conv-bn-training"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool, FusionError> {
        let replaced = fuse_conv_bn_training(graph, &self.config, &self.tracer)?;
        Ok(!replaced.is_empty())
    }
}

/// Convert-stage pass wrapping [`fold_conv_bn_quantized`].
#[derive(Clone, Debug)]
pub struct FoldConvBnQuantized<T = GraphTracer, O = OverloadAgnostic> {
    pub config: FusionConfig,
    pub tracer: T,
    pub operators: O,
}

impl FoldConvBnQuantized {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            tracer: GraphTracer,
            operators: OverloadAgnostic,
        }
    }
}

impl<T: Tracer + Debug, O: OperatorTable + Debug> Pass for FoldConvBnQuantized<T, O> {
    fn name(&self) -> &str {
        "fold-conv-bn-quantized"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool, FusionError> {
        let replaced = fold_conv_bn_quantized(graph, &self.config, &self.tracer, &self.operators)?;
        Ok(!replaced.is_empty())
    }
}
