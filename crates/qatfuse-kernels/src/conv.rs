//! Direct 2-D convolution over NCHW tensors.

use ndarray::{Array4, ArrayD, Ix1, Ix4};

use crate::error::KernelError;

/// Convolution hyper-parameters, in `(height, width)` order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conv2dParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            groups: 1,
        }
    }
}

fn output_extent(input: usize, kernel: usize, stride: usize, pad: usize, dilation: usize) -> Option<usize> {
    let span = dilation * (kernel.checked_sub(1)?) + 1;
    let padded = input + 2 * pad;
    if stride == 0 || padded < span {
        return None;
    }
    Some((padded - span) / stride + 1)
}

/// Computes `conv2d(input, weight) + bias`.
///
/// `input` is `[N, C, H, W]`, `weight` is `[O, C / groups, KH, KW]` and `bias`
/// (if any) is `[O]`.
pub fn conv2d(
    input: &ArrayD<f64>,
    weight: &ArrayD<f64>,
    bias: Option<&ArrayD<f64>>,
    params: &Conv2dParams,
) -> Result<ArrayD<f64>, KernelError> {
    let mismatch = || KernelError::ShapeMismatch {
        op: "convolution",
        lhs: input.shape().to_vec(),
        rhs: weight.shape().to_vec(),
    };

    let x = input.view().into_dimensionality::<Ix4>().map_err(|_| mismatch())?;
    let w = weight.view().into_dimensionality::<Ix4>().map_err(|_| mismatch())?;
    let (n, c, h, wd) = x.dim();
    let (o, cg, kh, kw) = w.dim();
    let groups = params.groups;
    if groups == 0 || cg * groups != c || o % groups != 0 {
        return Err(mismatch());
    }

    let b = match bias {
        Some(b) => {
            let b = b
                .view()
                .into_dimensionality::<Ix1>()
                .map_err(|_| KernelError::ShapeMismatch {
                    op: "convolution bias",
                    lhs: vec![o],
                    rhs: b.shape().to_vec(),
                })?;
            if b.len() != o {
                return Err(KernelError::ShapeMismatch {
                    op: "convolution bias",
                    lhs: vec![o],
                    rhs: b.shape().to_vec(),
                });
            }
            Some(b)
        }
        None => None,
    };

    let [sh, sw] = params.stride;
    let [ph, pw] = params.padding;
    let [dh, dw] = params.dilation;
    let oh = output_extent(h, kh, sh, ph, dh).ok_or_else(mismatch)?;
    let ow = output_extent(wd, kw, sw, pw, dw).ok_or_else(mismatch)?;
    let out_per_group = o / groups;

    let mut out = Array4::<f64>::zeros((n, o, oh, ow));
    for ni in 0..n {
        for oc in 0..o {
            let g = oc / out_per_group;
            let init = b.as_ref().map_or(0.0, |b| b[oc]);
            for y in 0..oh {
                for xo in 0..ow {
                    let mut acc = init;
                    for ic in 0..cg {
                        let ci = g * cg + ic;
                        for ky in 0..kh {
                            let iy = (y * sh + ky * dh) as isize - ph as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (xo * sw + kx * dw) as isize - pw as isize;
                                if ix < 0 || ix >= wd as isize {
                                    continue;
                                }
                                acc += x[[ni, ci, iy as usize, ix as usize]] * w[[oc, ic, ky, kx]];
                            }
                        }
                    }
                    out[[ni, oc, y, xo]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn tensor(shape: &[usize], data: Vec<f64>) -> ArrayD<f64> {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    fn input_3x3() -> ArrayD<f64> {
        tensor(&[1, 1, 3, 3], (0..9).map(f64::from).collect())
    }

    #[test]
    fn valid_convolution() {
        let w = ArrayD::ones(IxDyn(&[1, 1, 2, 2]));
        let out = conv2d(&input_3x3(), &w, None, &Conv2dParams::default()).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![8.0, 12.0, 20.0, 24.0]);
    }

    #[test]
    fn padded_strided_convolution() {
        let w = ArrayD::ones(IxDyn(&[1, 1, 2, 2]));
        let params = Conv2dParams {
            stride: [2, 2],
            padding: [1, 1],
            ..Conv2dParams::default()
        };
        let out = conv2d(&input_3x3(), &w, None, &params).unwrap();
        assert_eq!(out.shape(), &[1, 1, 2, 2]);
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![0.0, 3.0, 9.0, 24.0]);
    }

    #[test]
    fn bias_is_added_per_output_channel() {
        let w = tensor(&[2, 1, 1, 1], vec![1.0, 2.0]);
        let b = tensor(&[2], vec![0.5, -1.0]);
        let x = tensor(&[1, 1, 1, 2], vec![1.0, 2.0]);
        let out = conv2d(&x, &w, Some(&b), &Conv2dParams::default()).unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![1.5, 2.5, 1.0, 3.0]);
    }

    #[test]
    fn grouped_convolution() {
        let x = tensor(&[1, 2, 1, 1], vec![2.0, 3.0]);
        let w = tensor(&[2, 1, 1, 1], vec![10.0, 100.0]);
        let params = Conv2dParams {
            groups: 2,
            ..Conv2dParams::default()
        };
        let out = conv2d(&x, &w, None, &params).unwrap();
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![20.0, 300.0]);
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let w = ArrayD::ones(IxDyn(&[1, 2, 1, 1]));
        assert!(matches!(
            conv2d(&input_3x3(), &w, None, &Conv2dParams::default()),
            Err(KernelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn kernel_larger_than_input_is_rejected() {
        let w = ArrayD::ones(IxDyn(&[1, 1, 4, 4]));
        assert!(conv2d(&input_3x3(), &w, None, &Conv2dParams::default()).is_err());
    }
}
