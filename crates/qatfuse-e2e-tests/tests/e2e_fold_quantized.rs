//! End-to-end tests for convert-stage folding of quantized conv + batch norm
//! blocks.

mod common;

use common::{
    ConvBn, EPS, assert_close, assert_no_dangling_annotations, constant_operand, converted_model,
    count, folded_closed_form, forward, ramp,
};
use ndarray::ArrayD;
use qatfuse_ir::{Graph, NodeId, OpKind, Overload};
use qatfuse_kernels::{
    Conv2dParams, QuantRange, conv2d, dequantize_per_tensor, max_abs_diff, quantize_per_tensor,
};
use qatfuse_opt::{FusionConfig, fold_conv_bn_quantized, fold_quantized, orphan_constants};
use qatfuse_pattern::{ExactOverloads, GraphTracer, OverloadAgnostic, WeightQuantization};

const VARIANTS: [(WeightQuantization, bool); 4] = [
    (WeightQuantization::PerTensor, true),
    (WeightQuantization::PerTensor, false),
    (WeightQuantization::PerChannel, true),
    (WeightQuantization::PerChannel, false),
];

fn conv_of(graph: &Graph) -> NodeId {
    let convs: Vec<_> = graph
        .nodes()
        .iter()
        .filter(|n| n.kind == OpKind::Convolution)
        .map(|n| n.id)
        .collect();
    assert_eq!(convs.len(), 1);
    convs[0]
}

/// Integer-valued quantized input.
fn quantized_input(in_channels: usize) -> ArrayD<f32> {
    ramp(&[1, in_channels, 5, 5], 3, -100.0, 100.0).mapv(f32::round)
}

#[test]
fn folded_constants_match_closed_form() {
    for (i, (weight_quant, with_bias)) in VARIANTS.into_iter().enumerate() {
        let block = ConvBn::fixed(2, 3, 3, with_bias, i * 3);
        let folded = fold_quantized(converted_model(&block, weight_quant, Overload::Packet)).unwrap();

        assert_eq!(count(&folded, |k| *k == OpKind::NativeBatchNorm), 0);
        assert_eq!(count(&folded, |k| *k == OpKind::GetItem), 0);
        assert_eq!(count(&folded, |k| *k == OpKind::Div), 0);

        let (weight, bias) = folded_closed_form(&block, EPS);
        let conv = conv_of(&folded);
        let bias_name = constant_operand(&folded, conv, 2).expect("conv bias is a constant");
        let actual_w = folded.constant("b0.conv.weight").unwrap();
        let actual_b = folded.constant(bias_name).unwrap();
        assert_eq!(actual_w.shape(), block.weight.shape());
        assert_close(actual_w.iter().map(|&v| f64::from(v)), weight.iter().copied(), 1e-4);
        assert_close(actual_b.iter().map(|&v| f64::from(v)), bias, 1e-4);

        if with_bias {
            assert_eq!(bias_name, "b0.conv.bias");
        } else {
            assert_eq!(bias_name, "b0.conv.weight_bias");
        }
        assert_no_dangling_annotations(&folded);
    }
}

#[test]
fn folded_graph_runs_quantized_conv() {
    let block = ConvBn::fixed(2, 3, 3, true, 4);
    let folded =
        fold_quantized(converted_model(&block, WeightQuantization::PerTensor, Overload::Packet)).unwrap();
    let x = quantized_input(2);
    let actual = forward(&folded, &x);

    let act = QuantRange { min: -128, max: 127 };
    let wq = QuantRange { min: -127, max: 127 };
    let w = folded.constant("b0.conv.weight").unwrap().mapv(f64::from);
    let b = folded.constant("b0.conv.bias").unwrap().mapv(f64::from);
    let x = dequantize_per_tensor(&x.mapv(f64::from), 0.05, 0.0);
    let w = dequantize_per_tensor(&quantize_per_tensor(&w, 0.01, 0.0, wq), 0.01, 0.0);
    let y = conv2d(&x, &w, Some(&b), &Conv2dParams::default()).unwrap();
    let expected = quantize_per_tensor(&y, 0.1, 0.0, act);

    assert!(max_abs_diff(&actual, &expected).unwrap() < 1e-9);
}

#[test]
fn folding_is_idempotent() {
    for (weight_quant, with_bias) in VARIANTS {
        let block = ConvBn::fixed(2, 2, 1, with_bias, 8);
        let once = fold_quantized(converted_model(&block, weight_quant, Overload::Packet)).unwrap();
        let twice = fold_quantized(once.clone()).unwrap();
        assert_eq!(twice.node_count(), once.node_count());
        assert_eq!(twice.constants, once.constants);
        assert_eq!(twice.outputs, once.outputs);
    }
}

#[test]
fn pattern_overloads_are_canonicalized() {
    let block = ConvBn::fixed(2, 2, 3, true, 2);
    let target = converted_model(&block, WeightQuantization::PerChannel, Overload::Packet);
    let config = FusionConfig::default();

    let mut exact = target.clone();
    let replaced = fold_conv_bn_quantized(&mut exact, &config, &GraphTracer, &ExactOverloads).unwrap();
    assert!(replaced.is_empty());
    assert_eq!(exact.node_count(), target.node_count());

    let mut agnostic = target;
    let replaced = fold_conv_bn_quantized(&mut agnostic, &config, &GraphTracer, &OverloadAgnostic).unwrap();
    assert_eq!(replaced.len(), 1);
    assert!(
        agnostic
            .nodes()
            .iter()
            .filter_map(|n| n.kind.overload())
            .all(|o| o == Overload::Packet)
    );
}

#[test]
fn targets_with_any_overload_are_folded() {
    let block = ConvBn::fixed(2, 3, 3, true, 5);
    let (weight, bias) = folded_closed_form(&block, EPS);
    for overload in [Overload::Default, Overload::Tensor, Overload::Packet] {
        for weight_quant in [WeightQuantization::PerTensor, WeightQuantization::PerChannel] {
            let folded = fold_quantized(converted_model(&block, weight_quant, overload)).unwrap();
            assert_eq!(
                count(&folded, |k| *k == OpKind::NativeBatchNorm),
                0,
                "{overload:?} {weight_quant:?}"
            );
            let actual_w = folded.constant("b0.conv.weight").unwrap();
            let actual_b = folded.constant("b0.conv.bias").unwrap();
            assert_close(actual_w.iter().map(|&v| f64::from(v)), weight.iter().copied(), 1e-4);
            assert_close(actual_b.iter().map(|&v| f64::from(v)), bias.iter().copied(), 1e-4);
            assert_no_dangling_annotations(&folded);
        }
    }
}

#[test]
fn batch_norm_constants_are_left_orphaned() {
    let block = ConvBn::fixed(2, 2, 3, false, 6);
    let folded =
        fold_quantized(converted_model(&block, WeightQuantization::PerTensor, Overload::Packet)).unwrap();
    let mut orphans = orphan_constants(&folded);
    orphans.sort_unstable();
    assert_eq!(
        orphans,
        vec!["b0.bn.bias", "b0.bn.running_mean", "b0.bn.running_var", "b0.bn.weight"]
    );
}

#[test]
fn float_model_is_not_folded() {
    let model = common::float_model(&[ConvBn::fixed(2, 2, 3, true, 1)], EPS);
    let folded = fold_quantized(model.clone()).unwrap();
    assert_eq!(folded.node_count(), model.node_count());
    assert_eq!(folded.outputs, model.outputs);
}
