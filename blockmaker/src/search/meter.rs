//! Hash rate shared by all workers.
//!
//! Workers add their hash counts after every batch with a single atomic add.
//! Once per window one of them takes the lock, turns the count into a rate
//! and starts a new window; a worker that finds the lock taken just carries
//! on hashing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::tracing::prelude::*;
use crate::types::HashRate;

#[derive(Debug)]
pub struct HashMeter {
    window: Duration,
    log_interval: Duration,
    epoch: Instant,

    /// Hashes counted in the current window.
    count: AtomicU64,

    /// Start of the current window, in milliseconds since `epoch`.
    window_start_ms: AtomicU64,

    /// Last computed rate, as `f64` bits.
    rate_bits: AtomicU64,

    last_log: Mutex<Option<Instant>>,
}

impl HashMeter {
    pub fn new(window: Duration, log_interval: Duration) -> Self {
        Self {
            window,
            log_interval,
            epoch: Instant::now(),
            count: AtomicU64::new(0),
            window_start_ms: AtomicU64::new(0),
            rate_bits: AtomicU64::new(0f64.to_bits()),
            last_log: Mutex::new(None),
        }
    }

    /// Count `hashes` attempts.
    pub fn record(&self, hashes: u64) {
        self.count.fetch_add(hashes, Ordering::Relaxed);
        if self.window_elapsed() < self.window {
            return;
        }

        let Some(mut last_log) = self.last_log.try_lock() else {
            return;
        };
        // Another worker may have closed the window while we waited.
        let elapsed = self.window_elapsed();
        if elapsed < self.window {
            return;
        }

        let hashes = self.count.swap(0, Ordering::Relaxed);
        let rate = HashRate::from_count(hashes, elapsed);
        self.rate_bits.store(rate.as_f64().to_bits(), Ordering::Relaxed);
        self.window_start_ms.store(self.now_ms(), Ordering::Relaxed);

        let due = last_log.is_none_or(|at| at.elapsed() >= self.log_interval);
        if due {
            *last_log = Some(Instant::now());
            info!(rate = %rate, "Hash meter");
        }
    }

    /// Rate over the last completed window.
    pub fn rate(&self) -> HashRate {
        HashRate::new(f64::from_bits(self.rate_bits.load(Ordering::Relaxed)))
    }

    /// Drop any partial window and report zero until the next one closes.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.rate_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.window_start_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Hashes counted in the open window.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn window_elapsed(&self) -> Duration {
        let start = self.window_start_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(start))
    }
}

impl Default for HashMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(4), Duration::from_secs(30 * 60))
    }
}
