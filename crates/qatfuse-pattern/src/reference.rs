//! Reference computations for the conv + batch norm patterns.
//!
//! Float patterns take seven inputs:
//! `x, conv_weight, conv_bias, bn_weight, bn_bias, bn_running_mean, bn_running_var`.
//! Quantized patterns append
//! `input_scale, input_zero_point, weight_scale, weight_zero_point, output_scale,
//! output_zero_point`.
//!
//! A bias-free variant still takes `conv_bias` so that pattern and replacement
//! keep the same arity; the input is simply unused.

use qatfuse_ir::{Scalar, TensorMeta};

use crate::config::PatternConfig;
use crate::error::TraceError;
use crate::tracer::{ReferenceComputation, TraceContext, TracedValue};

const CONV_BN_INPUTS: [&str; 7] = [
    "x",
    "conv_weight",
    "conv_bias",
    "bn_weight",
    "bn_bias",
    "bn_running_mean",
    "bn_running_var",
];

const QUANT_PARAM_INPUTS: [&str; 6] = [
    "input_scale",
    "input_zero_point",
    "weight_scale",
    "weight_zero_point",
    "output_scale",
    "output_zero_point",
];

fn conv_bn_example_inputs(x: Scalar) -> Vec<TensorMeta> {
    vec![
        TensorMeta::new([1, 1, 3, 3], x),
        TensorMeta::f32([1, 1, 1, 1]),
        TensorMeta::f32([1]),
        TensorMeta::f32([1]),
        TensorMeta::f32([1]),
        TensorMeta::f32([1]),
        TensorMeta::f32([1]),
    ]
}

fn quantized_example_inputs() -> Vec<TensorMeta> {
    let mut inputs = conv_bn_example_inputs(Scalar::I8);
    for _ in 0..3 {
        inputs.push(TensorMeta::f32([1]));
        inputs.push(TensorMeta::new([1], Scalar::I32));
    }
    inputs
}

/// How convolution weights are fake-quantized.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum WeightQuantization {
    PerTensor,
    PerChannel,
}

/// Named float pattern inputs.
struct ConvBnInputs {
    x: TracedValue,
    weight: TracedValue,
    bias: TracedValue,
    bn_weight: TracedValue,
    bn_bias: TracedValue,
    running_mean: TracedValue,
    running_var: TracedValue,
}

/// Named quantization parameter inputs.
struct QuantInputs {
    input_scale: TracedValue,
    input_zero_point: TracedValue,
    weight_scale: TracedValue,
    weight_zero_point: TracedValue,
    output_scale: TracedValue,
    output_zero_point: TracedValue,
}

fn split_inputs(
    name: &str,
    inputs: &[TracedValue],
) -> Result<(ConvBnInputs, Option<QuantInputs>), TraceError> {
    let arity_error = || TraceError::ArityMismatch {
        reference: name.to_string(),
        expected: CONV_BN_INPUTS.len(),
        got: inputs.len(),
    };
    let (float, quant) = match inputs.len() {
        7 => (inputs, None),
        13 => (&inputs[..7], Some(&inputs[7..])),
        _ => return Err(arity_error()),
    };
    let &[x, weight, bias, bn_weight, bn_bias, running_mean, running_var] = float else {
        return Err(arity_error());
    };
    let quant = match quant {
        Some(
            &[
                input_scale,
                input_zero_point,
                weight_scale,
                weight_zero_point,
                output_scale,
                output_zero_point,
            ],
        ) => Some(QuantInputs {
            input_scale,
            input_zero_point,
            weight_scale,
            weight_zero_point,
            output_scale,
            output_zero_point,
        }),
        Some(_) => return Err(arity_error()),
        None => None,
    };
    Ok((
        ConvBnInputs {
            x,
            weight,
            bias,
            bn_weight,
            bn_bias,
            running_mean,
            running_var,
        },
        quant,
    ))
}

fn channel_shapes(cx: &TraceContext<'_>, weight: TracedValue) -> Result<(Vec<i64>, Vec<i64>), TraceError> {
    let rank = cx.rank(weight)?.max(2);
    let mut weight_shape = vec![1; rank];
    let mut bias_shape = vec![1; rank];
    weight_shape[0] = -1;
    bias_shape[1] = -1;
    Ok((weight_shape, bias_shape))
}

/// `scale_factor = bn_weight / sqrt(running_var + eps)`.
fn scale_factor(cx: &mut TraceContext<'_>, io: &ConvBnInputs, eps: f64) -> TracedValue {
    let var_eps = cx.add_scalar(io.running_var, eps);
    let running_std = cx.sqrt(var_eps);
    cx.div(io.bn_weight, running_std)
}

fn batch_norm(cx: &mut TraceContext<'_>, x: TracedValue, io: &ConvBnInputs, config: &PatternConfig) -> TracedValue {
    cx.batch_norm_training(
        x,
        io.bn_weight,
        io.bn_bias,
        io.running_mean,
        io.running_var,
        config.bn_momentum,
        config.bn_eps,
    )
}

fn fake_quantize_weight(
    cx: &mut TraceContext<'_>,
    weight: TracedValue,
    q: &QuantInputs,
    mode: WeightQuantization,
    config: &PatternConfig,
) -> TracedValue {
    match mode {
        WeightQuantization::PerTensor => {
            let w = cx.quantize_per_tensor(weight, q.weight_scale, q.weight_zero_point, config.weight);
            cx.dequantize_per_tensor(w, q.weight_scale, q.weight_zero_point, config.weight)
        }
        WeightQuantization::PerChannel => {
            let axis = config.per_channel_axis;
            let w = cx.quantize_per_channel(
                weight,
                q.weight_scale,
                q.weight_zero_point,
                axis,
                config.weight,
            );
            cx.dequantize_per_channel(w, q.weight_scale, q.weight_zero_point, axis, config.weight)
        }
    }
}

/// Plain `batch_norm_training(conv2d(x, w, b))`.
#[derive(Clone, Debug, Default)]
pub struct ConvBnReference {
    pub config: PatternConfig,
}

impl ReferenceComputation for ConvBnReference {
    fn name(&self) -> &str {
        "conv2d_bn"
    }

    fn input_names(&self) -> Vec<&'static str> {
        CONV_BN_INPUTS.to_vec()
    }

    fn example_inputs(&self) -> Vec<TensorMeta> {
        conv_bn_example_inputs(Scalar::F32)
    }

    fn build(&self, cx: &mut TraceContext<'_>, inputs: &[TracedValue]) -> Result<TracedValue, TraceError> {
        let (io, _) = split_inputs(self.name(), inputs)?;
        let conv = cx.conv2d(io.x, io.weight, Some(io.bias));
        Ok(batch_norm(cx, conv, &io, &self.config))
    }
}

/// Single-pass approximation of a fused conv + batch norm for training:
///
/// ```text
/// scale = bn_weight / sqrt(running_var + eps)
/// y = conv2d(x, w * scale, 0) / scale + b
/// out = batch_norm_training(y)
/// ```
///
/// The bias-free form drops the zero bias and the `+ b`.
#[derive(Clone, Debug)]
pub struct QatConvBnReference {
    pub with_bias: bool,
    pub config: PatternConfig,
}

impl QatConvBnReference {
    pub fn new(with_bias: bool, config: PatternConfig) -> Self {
        Self { with_bias, config }
    }
}

impl ReferenceComputation for QatConvBnReference {
    fn name(&self) -> &str {
        if self.with_bias {
            "qat_conv2d_bn"
        } else {
            "qat_conv2d_bn_no_conv_bias"
        }
    }

    fn input_names(&self) -> Vec<&'static str> {
        CONV_BN_INPUTS.to_vec()
    }

    fn example_inputs(&self) -> Vec<TensorMeta> {
        conv_bn_example_inputs(Scalar::F32)
    }

    fn build(&self, cx: &mut TraceContext<'_>, inputs: &[TracedValue]) -> Result<TracedValue, TraceError> {
        let (io, _) = split_inputs(self.name(), inputs)?;
        let (weight_shape, bias_shape) = channel_shapes(cx, io.weight)?;

        let scale = scale_factor(cx, &io, self.config.bn_eps);
        let scale_w = cx.reshape(scale, weight_shape);
        let scaled_weight = cx.mul(io.weight, scale_w);
        let zero_bias = self.with_bias.then(|| cx.zeros_like(io.bias));
        let conv = cx.conv2d(io.x, scaled_weight, zero_bias);
        let scale_b = cx.reshape(scale, bias_shape.clone());
        let mut y = cx.div(conv, scale_b);
        if self.with_bias {
            let bias = cx.reshape(io.bias, bias_shape);
            y = cx.add(y, bias);
        }
        Ok(batch_norm(cx, y, &io, &self.config))
    }
}

/// [`QatConvBnReference`] after convert: dequantized input, fake-quantized
/// scaled weight, quantized output.
#[derive(Clone, Debug)]
pub struct QuantizedQatConvBnReference {
    pub weight_quant: WeightQuantization,
    pub with_bias: bool,
    pub config: PatternConfig,
}

impl QuantizedQatConvBnReference {
    pub fn new(weight_quant: WeightQuantization, with_bias: bool, config: PatternConfig) -> Self {
        Self {
            weight_quant,
            with_bias,
            config,
        }
    }
}

fn quantized_input_names() -> Vec<&'static str> {
    CONV_BN_INPUTS.iter().chain(&QUANT_PARAM_INPUTS).copied().collect()
}

fn require_quant_inputs(name: &str, quant: Option<QuantInputs>, got: usize) -> Result<QuantInputs, TraceError> {
    quant.ok_or_else(|| TraceError::ArityMismatch {
        reference: name.to_string(),
        expected: CONV_BN_INPUTS.len() + QUANT_PARAM_INPUTS.len(),
        got,
    })
}

impl ReferenceComputation for QuantizedQatConvBnReference {
    fn name(&self) -> &str {
        match (self.weight_quant, self.with_bias) {
            (WeightQuantization::PerTensor, true) => "quantized_qat_conv2d_bn",
            (WeightQuantization::PerTensor, false) => "quantized_qat_conv2d_bn_no_conv_bias",
            (WeightQuantization::PerChannel, true) => "quantized_qat_conv2d_bn_per_channel",
            (WeightQuantization::PerChannel, false) => {
                "quantized_qat_conv2d_bn_per_channel_no_conv_bias"
            }
        }
    }

    fn input_names(&self) -> Vec<&'static str> {
        quantized_input_names()
    }

    fn example_inputs(&self) -> Vec<TensorMeta> {
        quantized_example_inputs()
    }

    fn build(&self, cx: &mut TraceContext<'_>, inputs: &[TracedValue]) -> Result<TracedValue, TraceError> {
        let (io, quant) = split_inputs(self.name(), inputs)?;
        let q = require_quant_inputs(self.name(), quant, inputs.len())?;
        let config = &self.config;
        let (weight_shape, bias_shape) = channel_shapes(cx, io.weight)?;

        let scale = scale_factor(cx, &io, config.bn_eps);
        let scale_w = cx.reshape(scale, weight_shape);
        let scaled_weight = cx.mul(io.weight, scale_w);
        let x = cx.dequantize_per_tensor(io.x, q.input_scale, q.input_zero_point, config.activation);
        let zero_bias = self.with_bias.then(|| cx.zeros_like(io.bias));
        let weight = fake_quantize_weight(cx, scaled_weight, &q, self.weight_quant, config);
        let conv = cx.conv2d(x, weight, zero_bias);
        let scale_b = cx.reshape(scale, bias_shape.clone());
        let mut y = cx.div(conv, scale_b);
        if self.with_bias {
            let bias = cx.reshape(io.bias, bias_shape);
            y = cx.add(y, bias);
        }
        let y = batch_norm(cx, y, &io, config);
        Ok(cx.quantize_per_tensor(y, q.output_scale, q.output_zero_point, config.activation))
    }
}

/// Replacement for [`QuantizedQatConvBnReference`]: the raw weight is
/// fake-quantized and fed to a plain conv + batch norm, ready for folding.
#[derive(Clone, Debug)]
pub struct FoldedQuantizedConvBnReference {
    pub weight_quant: WeightQuantization,
    pub with_bias: bool,
    pub config: PatternConfig,
}

impl FoldedQuantizedConvBnReference {
    pub fn new(weight_quant: WeightQuantization, with_bias: bool, config: PatternConfig) -> Self {
        Self {
            weight_quant,
            with_bias,
            config,
        }
    }
}

impl ReferenceComputation for FoldedQuantizedConvBnReference {
    fn name(&self) -> &str {
        match (self.weight_quant, self.with_bias) {
            (WeightQuantization::PerTensor, true) => "folded_quantized_qat_conv2d_bn",
            (WeightQuantization::PerTensor, false) => {
                "folded_quantized_qat_conv2d_bn_no_conv_bias"
            }
            (WeightQuantization::PerChannel, true) => {
                "folded_quantized_qat_conv2d_bn_per_channel"
            }
            (WeightQuantization::PerChannel, false) => {
                "folded_quantized_qat_conv2d_bn_per_channel_no_conv_bias"
            }
        }
    }

    fn input_names(&self) -> Vec<&'static str> {
        quantized_input_names()
    }

    fn example_inputs(&self) -> Vec<TensorMeta> {
        quantized_example_inputs()
    }

    fn build(&self, cx: &mut TraceContext<'_>, inputs: &[TracedValue]) -> Result<TracedValue, TraceError> {
        let (io, quant) = split_inputs(self.name(), inputs)?;
        let q = require_quant_inputs(self.name(), quant, inputs.len())?;
        let config = &self.config;

        let x = cx.dequantize_per_tensor(io.x, q.input_scale, q.input_zero_point, config.activation);
        let weight = fake_quantize_weight(cx, io.weight, &q, self.weight_quant, config);
        let conv = cx.conv2d(x, weight, self.with_bias.then_some(io.bias));
        let y = batch_norm(cx, conv, &io, config);
        Ok(cx.quantize_per_tensor(y, q.output_scale, q.output_zero_point, config.activation))
    }
}
