//! Symmetric int8 weight quantization.

use crate::config::Granularity;

/// Largest magnitude of a quantized value.
pub const QMAX: f32 = 127.0;

/// int8 values with one scale per tensor or per leading-axis slice.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    pub values: Vec<i8>,
    pub scales: Vec<f32>,
    pub shape: Vec<usize>,
}

impl QuantizedTensor {
    /// Values per scale.
    fn block(&self) -> usize {
        (self.values.len() / self.scales.len().max(1)).max(1)
    }

    pub fn dequantize(&self) -> Vec<f32> {
        if self.scales.is_empty() {
            return vec![0.0; self.values.len()];
        }
        let block = self.block();
        self.values
            .iter()
            .enumerate()
            .map(|(i, q)| *q as f32 * self.scales[(i / block).min(self.scales.len() - 1)])
            .collect()
    }

    /// Fraction of exactly-zero quantized values.
    pub fn sparsity(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().filter(|q| **q == 0).count() as f64 / self.values.len() as f64
    }
}

fn scale_for(values: &[f32]) -> f32 {
    let max = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if max > 0.0 { max / QMAX } else { 1.0 }
}

fn quantize_block(values: &[f32], scale: f32, out: &mut Vec<i8>) {
    out.extend(
        values
            .iter()
            .map(|v| (v / scale).round().clamp(-QMAX, QMAX) as i8),
    );
}

/// Quantize `values` of `shape`. Per-channel scales follow the first axis.
pub fn quantize(values: &[f32], shape: &[usize], granularity: Granularity) -> QuantizedTensor {
    let channels = shape.first().copied().unwrap_or(1).max(1);
    let mut quantized = Vec::with_capacity(values.len());

    let scales = match granularity {
        Granularity::PerChannel if values.len() % channels == 0 && !values.is_empty() => {
            let block = values.len() / channels;
            values
                .chunks_exact(block)
                .map(|chunk| {
                    let scale = scale_for(chunk);
                    quantize_block(chunk, scale, &mut quantized);
                    scale
                })
                .collect()
        }
        _ => {
            let scale = scale_for(values);
            quantize_block(values, scale, &mut quantized);
            vec![scale]
        }
    };

    QuantizedTensor {
        values: quantized,
        scales,
        shape: shape.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_tensor() {
        let q = quantize(&[1.27, -0.5, 0.0], &[3], Granularity::PerTensor);
        assert_eq!(q.scales.len(), 1);
        assert_eq!(q.values, vec![127, -50, 0]);
    }

    #[test]
    fn test_per_channel_scales() {
        let values = [0.1, -0.2, 10.0, 5.0];
        let q = quantize(&values, &[2, 2], Granularity::PerChannel);
        assert_eq!(q.scales.len(), 2);
        assert_eq!(q.values[1], -127);
        assert_eq!(q.values[2], 127);
        let restored = q.dequantize();
        for (a, b) in values.iter().zip(&restored) {
            assert!((a - b).abs() <= 0.5 * q.scales[0].max(q.scales[1]) + 1e-6);
        }
    }

    #[test]
    fn test_all_zero() {
        let q = quantize(&[0.0; 4], &[2, 2], Granularity::PerChannel);
        assert_eq!(q.values, vec![0; 4]);
        assert_eq!(q.sparsity(), 1.0);
        assert_eq!(q.dequantize(), vec![0.0; 4]);
    }
}
