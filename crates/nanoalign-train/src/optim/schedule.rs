//! Learning rate schedule for fine-tuning runs.

/// Multiplier on the base learning rate at optimizer step `step` (0-based).
///
/// Linear ramp from 0 over `warmup_steps`, then linear decay to 0 at
/// `total_steps`. With no warmup the first step runs at the full rate.
pub fn linear_warmup_decay(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    if step < warmup_steps {
        return step as f64 / warmup_steps as f64;
    }
    let remaining = total_steps.saturating_sub(step) as f64;
    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1) as f64;
    (remaining / decay_steps).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_warmup_starts_at_full_rate() {
        // Two epochs of one batch each: the default demo run.
        assert_eq!(linear_warmup_decay(0, 0, 2), 1.0);
        assert_eq!(linear_warmup_decay(1, 0, 2), 0.5);
    }

    #[test]
    fn test_decays_monotonically_to_zero() {
        let lrs: Vec<f64> = (0..=10).map(|s| linear_warmup_decay(s, 0, 10)).collect();
        assert!(lrs.windows(2).all(|w| w[1] < w[0]), "{:?}", lrs);
        assert!(lrs[9] > 0.0, "last trained step still moves weights");
        assert_eq!(lrs[10], 0.0);
    }

    #[test]
    fn test_warmup_then_decay() {
        assert_eq!(linear_warmup_decay(0, 2, 10), 0.0);
        assert_eq!(linear_warmup_decay(1, 2, 10), 0.5);
        assert_eq!(linear_warmup_decay(2, 2, 10), 1.0);
        assert!((linear_warmup_decay(6, 2, 10) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_past_the_end_stays_at_zero() {
        assert_eq!(linear_warmup_decay(12, 0, 10), 0.0);
        assert_eq!(linear_warmup_decay(0, 0, 0), 0.0);
    }
}
