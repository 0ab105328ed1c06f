//! Batch-norm folding.

use burn::tensor::{Tensor, backend::Backend};

use crate::error::ForgetError;
use crate::model::BasicConv2d;
use crate::model::inception::BN_EPSILON;

/// A convolution with its batch-norm folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedConv {
    pub index: usize,
    /// `[out, in, kh, kw]`, row-major.
    pub weight: Vec<f32>,
    pub shape: [usize; 4],
    pub bias: Vec<f32>,
    pub stride: usize,
    pub padding: [usize; 2],
}

/// Batch-norm statistics of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormParams {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub mean: Vec<f32>,
    pub var: Vec<f32>,
    pub epsilon: f64,
}

/// Scale each output channel of `kernel` by `gamma / sqrt(var + eps)` and
/// return the matching bias `beta - mean * scale`.
pub fn fold_batch_norm(
    kernel: &[f32],
    out_channels: usize,
    bn: &BatchNormParams,
) -> Result<(Vec<f32>, Vec<f32>), ForgetError> {
    let lengths = [bn.gamma.len(), bn.beta.len(), bn.mean.len(), bn.var.len()];
    if out_channels == 0 || lengths.iter().any(|&l| l != out_channels) {
        return Err(ForgetError::export(format!(
            "batch-norm sizes {lengths:?} do not match {out_channels} channels"
        )));
    }
    if kernel.len() % out_channels != 0 {
        return Err(ForgetError::export("kernel size is not a multiple of the channel count"));
    }

    let per_channel = kernel.len() / out_channels;
    let mut weight = Vec::with_capacity(kernel.len());
    let mut bias = Vec::with_capacity(out_channels);
    for (c, filter) in kernel.chunks_exact(per_channel).enumerate() {
        let scale = bn.gamma[c] / (bn.var[c] as f64 + bn.epsilon).sqrt() as f32;
        weight.extend(filter.iter().map(|w| w * scale));
        bias.push(bn.beta[c] - bn.mean[c] * scale);
    }
    Ok((weight, bias))
}

pub(crate) fn tensor_values<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
) -> Result<Vec<f32>, ForgetError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| ForgetError::export(format!("{e:?}")))
}

/// Fold a `BasicConv2d` into a biased convolution.
pub fn fold_conv<B: Backend>(conv: &BasicConv2d<B>) -> Result<FoldedConv, ForgetError> {
    let shape = conv.kernel_dims();
    let kernel = tensor_values(conv.conv.weight.val())?;
    let bn = BatchNormParams {
        gamma: tensor_values(conv.bn.gamma.val())?,
        beta: tensor_values(conv.bn.beta.val())?,
        mean: tensor_values(conv.bn.running_mean.value())?,
        var: tensor_values(conv.bn.running_var.value())?,
        epsilon: BN_EPSILON,
    };
    let (weight, bias) = fold_batch_norm(&kernel, shape[0], &bn)?;
    Ok(FoldedConv {
        index: conv.conv_index,
        weight,
        shape,
        bias,
        stride: conv.stride,
        padding: [conv.pad_h, conv.pad_w],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bn(gamma: f32, beta: f32, mean: f32, var: f32) -> BatchNormParams {
        BatchNormParams {
            gamma: vec![gamma; 2],
            beta: vec![beta; 2],
            mean: vec![mean; 2],
            var: vec![var; 2],
            epsilon: 0.0,
        }
    }

    #[test]
    fn test_identity_norm() {
        let kernel = [1.0, -2.0, 3.0, 0.0];
        let (weight, bias) = fold_batch_norm(&kernel, 2, &bn(1.0, 0.0, 0.0, 1.0)).unwrap();
        assert_eq!(weight, kernel.to_vec());
        assert_eq!(bias, vec![0.0, 0.0]);
    }

    #[test]
    fn test_folding_matches_norm() {
        // bn(conv(x)) == folded(x) for a 1x1 conv on a single input value.
        let kernel = [0.5, -1.5];
        let params = bn(2.0, 0.25, 1.0, 4.0);
        let (weight, bias) = fold_batch_norm(&kernel, 2, &params).unwrap();
        let x = 3.0f32;
        for c in 0..2 {
            let y = kernel[c] * x;
            let expected = (y - 1.0) / 2.0 * 2.0 + 0.25;
            assert!((weight[c] * x + bias[c] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zeros_stay_zero() {
        let params = bn(3.0, 1.0, 0.5, 2.0);
        let (weight, _) = fold_batch_norm(&[0.0, 1.0, 0.0, 1.0], 2, &params).unwrap();
        assert_eq!(weight[0], 0.0);
        assert_eq!(weight[2], 0.0);
    }

    #[test]
    fn test_size_mismatch() {
        assert!(fold_batch_norm(&[1.0, 2.0, 3.0], 2, &bn(1.0, 0.0, 0.0, 1.0)).is_err());
    }
}
