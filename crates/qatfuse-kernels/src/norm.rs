//! Batch normalization over the channel axis (axis 1).

use ndarray::{Array1, ArrayD, Axis};

use crate::error::KernelError;

/// Result of [`batch_norm`]: the normalized tensor plus the statistics used.
#[derive(Clone, Debug)]
pub struct BatchNormOutput {
    pub output: ArrayD<f64>,
    /// Per-channel mean used for normalization.
    pub save_mean: Array1<f64>,
    /// Per-channel `1 / sqrt(var + eps)`.
    pub save_rstd: Array1<f64>,
}

fn per_channel<'a>(
    name: &'static str,
    value: Option<&'a ArrayD<f64>>,
    channels: usize,
) -> Result<Option<&'a ArrayD<f64>>, KernelError> {
    match value {
        Some(v) if v.len() != channels => Err(KernelError::ShapeMismatch {
            op: name,
            lhs: vec![channels],
            rhs: v.shape().to_vec(),
        }),
        other => Ok(other),
    }
}

/// Normalizes `input` per channel.
///
/// In training mode the batch statistics (biased variance) are used;
/// otherwise the running statistics. Missing `weight` / `bias` act as ones /
/// zeros. Running statistics are not updated.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm(
    input: &ArrayD<f64>,
    weight: Option<&ArrayD<f64>>,
    bias: Option<&ArrayD<f64>>,
    running_mean: &ArrayD<f64>,
    running_var: &ArrayD<f64>,
    training: bool,
    eps: f64,
) -> Result<BatchNormOutput, KernelError> {
    if input.ndim() < 2 {
        return Err(KernelError::ShapeMismatch {
            op: "batch_norm",
            lhs: input.shape().to_vec(),
            rhs: running_mean.shape().to_vec(),
        });
    }
    let channels = input.shape()[1];
    let weight = per_channel("batch_norm weight", weight, channels)?;
    let bias = per_channel("batch_norm bias", bias, channels)?;
    per_channel("batch_norm running_mean", Some(running_mean), channels)?;
    per_channel("batch_norm running_var", Some(running_var), channels)?;

    let mut output = input.clone();
    let mut save_mean = Array1::zeros(channels);
    let mut save_rstd = Array1::zeros(channels);
    let flat = |a: &ArrayD<f64>, c: usize| a.iter().nth(c).copied();

    for c in 0..channels {
        let slice = input.index_axis(Axis(1), c);
        let (mean, var) = if training {
            let mean = slice.mean().unwrap_or(0.0);
            let var = slice.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
            (mean, var)
        } else {
            (
                flat(running_mean, c).unwrap_or(0.0),
                flat(running_var, c).unwrap_or(1.0),
            )
        };
        let rstd = 1.0 / (var + eps).sqrt();
        let gamma = weight.and_then(|w| flat(w, c)).unwrap_or(1.0);
        let beta = bias.and_then(|b| flat(b, c)).unwrap_or(0.0);

        output
            .index_axis_mut(Axis(1), c)
            .mapv_inplace(|v| (v - mean) * rstd * gamma + beta);
        save_mean[c] = mean;
        save_rstd[c] = rstd;
    }

    Ok(BatchNormOutput {
        output,
        save_mean,
        save_rstd,
    })
}
