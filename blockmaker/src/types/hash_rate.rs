//! Hashes per second, for logs and telemetry.

use std::fmt;

/// Measured hash rate in hashes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd)]
pub struct HashRate(f64);

impl HashRate {
    pub const ZERO: Self = Self(0.0);

    pub fn new(hashes_per_second: f64) -> Self {
        if hashes_per_second.is_finite() && hashes_per_second > 0.0 {
            Self(hashes_per_second)
        } else {
            Self::ZERO
        }
    }

    /// Rate of `hashes` done over `elapsed`.
    pub fn from_count(hashes: u64, elapsed: std::time::Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self::ZERO;
        }
        Self::new(hashes as f64 / secs)
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }
}

impl From<HashRate> for f64 {
    fn from(rate: HashRate) -> Self {
        rate.0
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;

        let (scaled, suffix) = if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            (value, "")
        };

        if scaled >= 100.0 || scaled.fract() == 0.0 {
            write!(f, "{:.0} {}H/s", scaled, suffix) // "112 TH/s" or "1 H/s"
        } else if scaled >= 10.0 {
            write!(f, "{:.1} {}H/s", scaled, suffix) // "11.2 TH/s"
        } else {
            write!(f, "{:.2} {}H/s", scaled, suffix) // "1.12 TH/s"
        }
    }
}
