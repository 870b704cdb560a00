//! Health Weights
//!
//! Turns a key's error history into a time-decayed selection weight. The
//! weight is a pure function of the clock and the key's state, so it is
//! recomputed on every selection instead of being cached.
//!
//! ```text
//! decay           = exp(-ln2 * (now - last_error_at) / half_life)
//! effective_errs  = consecutive_errors * decay
//! multiplier      = clamp(1.0 - beta * effective_errs, min_multiplier, 1.0)
//! weight          = max(1, round(base_weight * multiplier))
//! ```

use crate::config::{HealthConfig, secs_to_ms};
use keyroute_core::QuotaStateEntry;
use std::f64::consts::LN_2;

/// Computes decayed health weights from quota state
#[derive(Debug, Clone)]
pub struct HealthWeightCalculator {
    base_weight: u32,
    half_life_ms: f64,
    beta: f64,
    min_multiplier: f64,
}

impl HealthWeightCalculator {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            base_weight: config.base_weight,
            half_life_ms: secs_to_ms(config.half_life_secs) as f64,
            beta: config.beta,
            min_multiplier: config.min_multiplier,
        }
    }

    pub fn base_weight(&self) -> u32 {
        self.base_weight
    }

    pub fn min_multiplier(&self) -> f64 {
        self.min_multiplier
    }

    /// Health multiplier in `[min_multiplier, 1.0]`
    pub fn multiplier(&self, now_ms: i64, last_error_at_ms: Option<i64>, consecutive_errors: u32) -> f64 {
        let Some(last_error_at_ms) = last_error_at_ms else {
            return 1.0;
        };
        if consecutive_errors == 0 {
            return 1.0;
        }

        // Clock skew can put the error in the future; treat it as just happened
        let elapsed = now_ms.saturating_sub(last_error_at_ms).max(0) as f64;
        let decay = (-LN_2 * elapsed / self.half_life_ms).exp();
        let effective_errors = f64::from(consecutive_errors) * decay;

        (1.0 - self.beta * effective_errors).clamp(self.min_multiplier, 1.0)
    }

    /// Selection weight, never below 1
    pub fn weight(&self, now_ms: i64, last_error_at_ms: Option<i64>, consecutive_errors: u32) -> u32 {
        let multiplier = self.multiplier(now_ms, last_error_at_ms, consecutive_errors);
        let weight = (f64::from(self.base_weight) * multiplier).round() as u32;
        weight.max(1)
    }

    /// Selection weight of a quota entry
    pub fn weight_of(&self, entry: &QuotaStateEntry, now_ms: i64) -> u32 {
        self.weight(now_ms, entry.last_error_at_ms, entry.consecutive_error_count)
    }
}

impl Default for HealthWeightCalculator {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HALF_LIFE_MS: i64 = 600_000;

    #[test]
    fn test_no_errors_full_weight() {
        let calc = HealthWeightCalculator::default();
        assert_eq!(calc.weight(1_000, None, 0), 100);
        assert_eq!(calc.weight(1_000, Some(1_000), 0), 100);
        assert_eq!(calc.multiplier(1_000, None, 5), 1.0);
    }

    #[test]
    fn test_fresh_errors_reduce_weight() {
        let calc = HealthWeightCalculator::default();
        // 1 - 0.1 * 2 = 0.8
        assert_eq!(calc.weight(0, Some(0), 2), 80);
        // 1 - 0.1 * 3 = 0.7
        assert_eq!(calc.weight(0, Some(0), 3), 70);
    }

    #[test]
    fn test_floor_applies() {
        let calc = HealthWeightCalculator::default();
        assert_eq!(calc.weight(0, Some(0), 50), 50);
        assert_eq!(calc.multiplier(0, Some(0), 50), 0.5);
    }

    #[test]
    fn test_half_life_decay() {
        let calc = HealthWeightCalculator::default();
        // 4 errors one half-life ago count as 2
        assert_eq!(calc.weight(HALF_LIFE_MS, Some(0), 4), 80);
        // Two half-lives: 1 effective error
        assert_eq!(calc.weight(2 * HALF_LIFE_MS, Some(0), 4), 90);
    }

    #[test]
    fn test_future_error_timestamp_clamped() {
        let calc = HealthWeightCalculator::default();
        assert_eq!(calc.weight(0, Some(60_000), 2), calc.weight(0, Some(0), 2));
    }

    #[test]
    fn test_weight_never_zero() {
        let calc = HealthWeightCalculator::new(&HealthConfig {
            base_weight: 1,
            half_life_secs: 600,
            beta: 1.0,
            min_multiplier: 0.1,
        });
        assert_eq!(calc.weight(0, Some(0), 10), 1);
    }

    #[test]
    fn test_weight_of_entry() {
        let calc = HealthWeightCalculator::default();
        let entry = QuotaStateEntry {
            consecutive_error_count: 1,
            last_error_at_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(calc.weight_of(&entry, 0), 90);
    }

    proptest! {
        #[test]
        fn prop_monotonic_recovery(
            errors in 0u32..1_000,
            t1 in 0i64..10_000_000,
            dt in 0i64..10_000_000,
        ) {
            let calc = HealthWeightCalculator::default();
            let t2 = t1 + dt;
            prop_assert!(calc.multiplier(t2, Some(0), errors) >= calc.multiplier(t1, Some(0), errors));
            prop_assert!(calc.weight(t2, Some(0), errors) >= calc.weight(t1, Some(0), errors));
        }

        #[test]
        fn prop_multiplier_bounded(errors in 0u32..1_000, elapsed in 0i64..100_000_000) {
            let calc = HealthWeightCalculator::default();
            let m = calc.multiplier(elapsed, Some(0), errors);
            prop_assert!((0.5..=1.0).contains(&m));
            prop_assert!(calc.weight(elapsed, Some(0), errors) >= 1);
        }
    }
}
