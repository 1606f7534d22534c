//! Fusion pass configuration.

use qatfuse_pattern::PatternConfig;

/// Options shared by the training and convert stage passes.
#[derive(Clone, Debug, PartialEq)]
pub struct FusionConfig {
    /// Constants baked into the traced patterns.
    pub patterns: PatternConfig,
    /// Match subgraphs regardless of literal operand values (strides, epsilon,
    /// quantization ranges). Literals of the original nodes are copied onto
    /// the replacement afterwards.
    pub ignore_literals: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            patterns: PatternConfig::default(),
            ignore_literals: true,
        }
    }
}
