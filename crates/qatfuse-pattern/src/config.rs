//! Constants baked into the conv + batch norm patterns.

use qatfuse_ir::Scalar;

/// Quantized value range and storage type of one operand class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantBounds {
    pub quant_min: i64,
    pub quant_max: i64,
    pub dtype: Scalar,
}

/// Pattern constants.
///
/// Defaults: batch norm epsilon `1e-5`, int8 activations in `[-128, 127]`,
/// int8 weights in `[-127, 127]`, per-channel weight axis `0`.
#[derive(Clone, Debug, PartialEq)]
pub struct PatternConfig {
    pub bn_eps: f64,
    /// Batch norm momentum recorded on traced batch norm nodes.
    pub bn_momentum: f64,
    pub activation: QuantBounds,
    pub weight: QuantBounds,
    pub per_channel_axis: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            bn_eps: 1e-5,
            bn_momentum: 0.1,
            activation: QuantBounds {
                quant_min: -128,
                quant_max: 127,
                dtype: Scalar::I8,
            },
            weight: QuantBounds {
                quant_min: -127,
                quant_max: 127,
                dtype: Scalar::I8,
            },
            per_channel_axis: 0,
        }
    }
}
