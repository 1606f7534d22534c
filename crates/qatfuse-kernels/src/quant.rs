//! Affine quantize / dequantize kernels.
//!
//! Quantized values are kept as integral `f64`s so they can flow through the
//! same interpreter value type as float tensors.

use ndarray::{ArrayD, Axis};

use crate::error::KernelError;

/// Inclusive integer range of a quantized type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantRange {
    pub min: i64,
    pub max: i64,
}

fn quantize_value(v: f64, scale: f64, zero_point: f64, range: QuantRange) -> f64 {
    ((v * (1.0 / scale)).round_ties_even() + zero_point).clamp(range.min as f64, range.max as f64)
}

/// `clamp(round(x / scale) + zero_point, min, max)`.
pub fn quantize_per_tensor(x: &ArrayD<f64>, scale: f64, zero_point: f64, range: QuantRange) -> ArrayD<f64> {
    x.mapv(|v| quantize_value(v, scale, zero_point, range))
}

/// `(q - zero_point) * scale`.
pub fn dequantize_per_tensor(q: &ArrayD<f64>, scale: f64, zero_point: f64) -> ArrayD<f64> {
    q.mapv(|v| (v - zero_point) * scale)
}

fn check_channels(
    op: &'static str,
    x: &ArrayD<f64>,
    scales: &[f64],
    zero_points: &[f64],
    axis: usize,
) -> Result<(), KernelError> {
    let dim = x.shape().get(axis).copied();
    if dim != Some(scales.len()) || scales.len() != zero_points.len() {
        return Err(KernelError::ShapeMismatch {
            op,
            lhs: x.shape().to_vec(),
            rhs: vec![scales.len(), zero_points.len()],
        });
    }
    Ok(())
}

/// Per-channel quantization along `axis`.
pub fn quantize_per_channel(
    x: &ArrayD<f64>,
    scales: &[f64],
    zero_points: &[f64],
    axis: usize,
    range: QuantRange,
) -> Result<ArrayD<f64>, KernelError> {
    check_channels("quantize_per_channel", x, scales, zero_points, axis)?;
    let mut out = x.clone();
    for (c, mut lane) in out.axis_iter_mut(Axis(axis)).enumerate() {
        let (s, zp) = (scales[c], zero_points[c]);
        lane.mapv_inplace(|v| quantize_value(v, s, zp, range));
    }
    Ok(out)
}

/// Per-channel dequantization along `axis`.
pub fn dequantize_per_channel(
    q: &ArrayD<f64>,
    scales: &[f64],
    zero_points: &[f64],
    axis: usize,
) -> Result<ArrayD<f64>, KernelError> {
    check_channels("dequantize_per_channel", q, scales, zero_points, axis)?;
    let mut out = q.clone();
    for (c, mut lane) in out.axis_iter_mut(Axis(axis)).enumerate() {
        let (s, zp) = (scales[c], zero_points[c]);
        lane.mapv_inplace(|v| (v - zp) * s);
    }
    Ok(out)
}
