//! Retry delays after failed template builds.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

/// Retry delay for a worker whose template builds keep failing.
///
/// The nominal delay starts at `initial` and doubles per consecutive
/// failure up to `max`. Each returned delay is shortened by a random
/// factor in [0.5, 1.0] so threads that failed on the same node event do
/// not all retry at once.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    failures: u32,
    seed: RandomState,
    draws: u64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
            seed: RandomState::new(),
            draws: 0,
        }
    }

    /// Delay before the next retry. Counts one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.failures).unwrap_or(u32::MAX);
        let nominal = self.initial.saturating_mul(factor).min(self.max);
        self.failures = self.failures.saturating_add(1);
        nominal.mul_f64(self.jitter())
    }

    /// Forget past failures after a build succeeds.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    fn jitter(&mut self) -> f64 {
        let mut hasher = self.seed.build_hasher();
        hasher.write_u64(self.draws);
        self.draws = self.draws.wrapping_add(1);
        0.5 + 0.5 * (hasher.finish() as f64 / u64::MAX as f64)
    }
}
