//! Magnitude masks over flat weight buffers.

/// Mask zeroing exactly `round(sparsity * n)` of the smallest-magnitude weights.
///
/// Entries are `1.0` (kept) or `0.0` (pruned). Ties are broken by position so
/// the count is exact even when many weights share a magnitude.
pub fn magnitude_mask(weights: &[f32], sparsity: f64) -> Vec<f32> {
    let n = weights.len();
    let prune = ((sparsity.clamp(0.0, 1.0) * n as f64).round() as usize).min(n);

    let mut mask = vec![1.0f32; n];
    if prune == 0 {
        return mask;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.select_nth_unstable_by(prune - 1, |&a, &b| {
        weights[a]
            .abs()
            .total_cmp(&weights[b].abs())
            .then(a.cmp(&b))
    });
    for &index in &order[..prune] {
        mask[index] = 0.0;
    }
    mask
}

/// Fraction of exactly-zero entries.
pub fn sparsity_of(weights: &[f32]) -> f64 {
    if weights.is_empty() {
        return 0.0;
    }
    weights.iter().filter(|w| **w == 0.0).count() as f64 / weights.len() as f64
}

/// Mask keeping every non-zero weight, for weights pruned earlier.
pub fn mask_from_zeros(weights: &[f32]) -> Vec<f32> {
    weights.iter().map(|w| if *w == 0.0 { 0.0 } else { 1.0 }).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prunes_smallest() {
        let weights = [0.1, -5.0, 0.3, -0.05, 2.0, 0.0];
        let mask = magnitude_mask(&weights, 0.5);
        assert_eq!(mask, vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_exact_count_with_ties() {
        let weights = [1.0f32; 10];
        let mask = magnitude_mask(&weights, 0.3);
        assert_eq!(mask.iter().filter(|m| **m == 0.0).count(), 3);
    }

    #[test]
    fn test_zero_and_empty() {
        assert_eq!(magnitude_mask(&[1.0, 2.0], 0.0), vec![1.0, 1.0]);
        assert!(magnitude_mask(&[], 0.5).is_empty());
    }

    #[test]
    fn test_sparsity_of() {
        assert_eq!(sparsity_of(&[0.0, 1.0, 0.0, 2.0]), 0.5);
        assert_eq!(sparsity_of(&[]), 0.0);
        assert_eq!(mask_from_zeros(&[0.0, 3.0]), vec![0.0, 1.0]);
    }
}
