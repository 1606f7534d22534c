//! Reference tensor kernels for qatfuse graphs.
//!
//! Straightforward (unoptimized) implementations of every operator in the
//! closed [`qatfuse_ir::OpKind`] set except opaque operators, plus an
//! [`Interpreter`] that evaluates a whole graph. Used as the numeric oracle
//! when checking that a rewrite preserved the forward pass.

pub mod conv;
mod error;
pub mod interp;
pub mod norm;
pub mod quant;

pub use conv::{Conv2dParams, conv2d};
pub use error::KernelError;
pub use interp::{Interpreter, Value, broadcast_shape, evaluate};
pub use norm::{BatchNormOutput, batch_norm};
pub use quant::{
    QuantRange, dequantize_per_channel, dequantize_per_tensor, quantize_per_channel,
    quantize_per_tensor,
};

/// Largest absolute element-wise difference between two tensors of equal shape.
///
/// Returns `None` if the shapes differ.
pub fn max_abs_diff(a: &ndarray::ArrayD<f64>, b: &ndarray::ArrayD<f64>) -> Option<f64> {
    (a.shape() == b.shape()).then(|| {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    })
}
