//! Decaying reliability accumulator
//!
//! One instance tracks one horizon of connection outcomes for one address.
//! Older observations fade geometrically with the horizon's time constant.

/// 2 hour horizon time constant (seconds)
pub const TAU_2H: f64 = 3600.0 * 2.0;

/// 8 hour horizon time constant (seconds)
pub const TAU_8H: f64 = 3600.0 * 8.0;

/// 1 day horizon time constant (seconds)
pub const TAU_1D: f64 = 3600.0 * 24.0;

/// 1 week horizon time constant (seconds)
pub const TAU_1W: f64 = 3600.0 * 24.0 * 7.0;

/// 1 month horizon time constant (seconds)
pub const TAU_1M: f64 = 3600.0 * 24.0 * 30.0;

/// Recent track record over one horizon
///
/// Stored as `f32` to match the persisted layout.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReliabilityStat {
    pub weight: f32,
    pub count: f32,
    pub reliability: f32,
}

impl ReliabilityStat {
    /// Fold one observation `age` seconds after the previous one
    ///
    /// Negative ages are clamped to zero. Out-of-order observations are not
    /// corrected for.
    pub fn update(&mut self, good: bool, age: i64, tau: f64) {
        let f = (-(age.max(0) as f64) / tau).exp();
        let reliability = self.reliability as f64 * f + if good { 1.0 - f } else { 0.0 };
        let count = self.count as f64 * f + 1.0;
        let weight = self.weight as f64 * f + (1.0 - f);

        self.reliability = reliability as f32;
        self.count = count as f32;
        self.weight = weight as f32;
    }

    /// Success rate with the recency bias of `weight` removed
    pub fn margin(&self) -> f64 {
        self.reliability as f64 - self.weight as f64 + 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_update_from_zero_age() {
        let mut stat = ReliabilityStat::default();
        stat.update(true, 0, TAU_2H);

        // f == 1 so nothing but the count moves
        assert_eq!(stat.reliability, 0.0);
        assert_eq!(stat.weight, 0.0);
        assert_eq!(stat.count, 1.0);
    }

    #[test]
    fn test_good_update_raises_reliability() {
        let mut stat = ReliabilityStat::default();
        stat.update(true, 3600, TAU_2H);

        let expected = 1.0 - (-0.5f64).exp();
        assert!((stat.reliability as f64 - expected).abs() < 1e-6);
        assert!((stat.weight as f64 - expected).abs() < 1e-6);
        assert!((stat.margin() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bad_update_lowers_margin() {
        let mut stat = ReliabilityStat::default();
        for _ in 0..10 {
            stat.update(false, 3600, TAU_1D);
        }

        assert_eq!(stat.reliability, 0.0);
        assert!(stat.weight > 0.3);
        assert!(stat.margin() < 0.7);
    }

    #[test]
    fn test_negative_age_is_clamped() {
        let mut stat = ReliabilityStat::default();
        stat.update(true, -500, TAU_1W);
        assert_eq!(stat.count, 1.0);
        assert_eq!(stat.weight, 0.0);
    }

    proptest! {
        /// Reliability stays within [0, 1] for any sequence of observations
        #[test]
        fn reliability_stays_bounded(
            steps in prop::collection::vec((any::<bool>(), 0i64..10_000_000), 1..200)
        ) {
            let mut stat = ReliabilityStat::default();
            for (good, age) in steps {
                stat.update(good, age, TAU_1D);
                prop_assert!(stat.reliability >= 0.0);
                prop_assert!(stat.reliability <= 1.0 + 1e-6);
                prop_assert!(stat.weight >= 0.0);
                prop_assert!(stat.weight <= 1.0 + 1e-6);
                prop_assert!(stat.reliability <= stat.weight + 1e-6);
            }
        }

        /// A steady stream of successes drives weight and reliability toward 1
        #[test]
        fn weight_converges_under_successes(age in 3600i64..86_400) {
            let mut stat = ReliabilityStat::default();
            for _ in 0..500 {
                stat.update(true, age, TAU_8H);
            }
            prop_assert!(stat.weight > 0.99);
            prop_assert!(stat.reliability > 0.99);
        }
    }
}
