//! Randomized interval perturbation.

use std::time::Duration;

/// Jitter factor lower bound.
const FACTOR_MIN: f64 = 0.9;
/// Jitter factor span; upper bound is `FACTOR_MIN + FACTOR_SPAN`.
const FACTOR_SPAN: f64 = 0.2;

/// Source of schedule jitter.
///
/// Every periodic re-poll interval is perturbed by a uniform factor in
/// `[0.9, 1.1]` so a fleet of devices provisioned at the same moment does not
/// herd into synchronized discovery storms. The generator is injectable and
/// seedable so jitter bounds stay deterministic under test.
#[derive(Debug, Clone)]
pub struct Jitter {
    rng: fastrand::Rng,
}

impl Jitter {
    /// Jitter from an OS-seeded generator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: fastrand::Rng::new(),
        }
    }

    /// Jitter from a fixed seed; identical seeds replay identical schedules.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Perturb `base` by a uniform factor in `[0.9, 1.1]`.
    pub fn interval(&mut self, base: Duration) -> Duration {
        let factor = FACTOR_MIN + self.rng.f64() * FACTOR_SPAN;
        base.mul_f64(factor)
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn seeded_jitter_replays_the_same_schedule() {
        let base = Duration::from_secs(600);
        let mut a = Jitter::with_seed(42);
        let mut b = Jitter::with_seed(42);
        for _ in 0..32 {
            assert_eq!(a.interval(base), b.interval(base));
        }
    }

    #[test]
    fn successive_intervals_vary() {
        let base = Duration::from_secs(600);
        let mut jitter = Jitter::with_seed(7);
        let first = jitter.interval(base);
        let distinct = (0..16).any(|_| jitter.interval(base) != first);
        assert!(distinct, "32 draws from one seed never varied");
    }

    proptest! {
        #[test]
        fn interval_stays_within_ten_percent(seed: u64, base_secs in 1u64..=2_000_000) {
            let base = Duration::from_secs(base_secs);
            let mut jitter = Jitter::with_seed(seed);
            for _ in 0..8 {
                let perturbed = jitter.interval(base);
                prop_assert!(perturbed >= base.mul_f64(0.9));
                prop_assert!(perturbed <= base.mul_f64(1.1));
            }
        }
    }
}
