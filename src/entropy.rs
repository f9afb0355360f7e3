//! Shannon entropy over log-probability vectors

/// Entropy (nats) of a distribution given as natural-log probabilities.
///
/// Zero-probability entries (`-inf`) contribute nothing. Log-probabilities
/// that round slightly above zero are treated as zero, so the result is
/// never negative.
pub fn entropy_from_log_probs(log_probs: &[f32]) -> f64 {
    let h: f64 = log_probs.iter().map(|&lp| plogp(f64::from(lp))).sum();
    (-h).max(0.0)
}

/// `p * ln p` with `p = exp(lp)`, defined as 0 at `p = 0`.
fn plogp(lp: f64) -> f64 {
    if lp.is_nan() || lp == f64::NEG_INFINITY {
        return 0.0;
    }
    let lp = lp.min(0.0);
    let p = lp.exp();
    if p == 0.0 {
        0.0
    } else {
        p * lp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    #[test]
    fn test_uniform_distribution() {
        let n = 8usize;
        let lp = -(n as f32).ln();
        let h = entropy_from_log_probs(&vec![lp; n]);
        assert!((h - (n as f64).ln()).abs() < EPS, "h={h}");
    }

    #[test]
    fn test_zero_probabilities_do_not_produce_nan() {
        let dist = [0.0f32, f32::NEG_INFINITY, f32::NEG_INFINITY];
        let h = entropy_from_log_probs(&dist);
        assert!(!h.is_nan());
        assert_eq!(h, 0.0);
    }

    #[test]
    fn test_mixed_zero_and_nonzero() {
        let half = 0.5f32.ln();
        let dist = [half, f32::NEG_INFINITY, half];
        let h = entropy_from_log_probs(&dist);
        assert!((h - std::f64::consts::LN_2).abs() < EPS);
    }

    #[test]
    fn test_underflowing_probabilities() {
        // exp(-800) underflows to exactly 0 in f64
        let dist = [0.0f32, -800.0, -1e30];
        let h = entropy_from_log_probs(&dist);
        assert!(h.is_finite());
        assert!(h >= 0.0);
    }

    #[test]
    fn test_rounding_above_zero_is_clamped() {
        let dist = [1e-7f32, f32::NEG_INFINITY];
        assert_eq!(entropy_from_log_probs(&dist), 0.0);
    }

    #[test]
    fn test_empty_distribution() {
        assert_eq!(entropy_from_log_probs(&[]), 0.0);
    }
}
