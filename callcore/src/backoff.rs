//! Retry delay arithmetic shared by the channels and the reconnect logic.

use rand::Rng;
use std::time::Duration;

const RETRY_CAP_MS: u64 = 25_000;

/// Bounds, in milliseconds, of the delay after `failures` consecutive failures.
///
/// The first retry comes almost immediately; later ones spread out by about
/// two seconds per failure up to 25 seconds.
pub fn retry_interval_bounds(failures: u32) -> (u64, u64) {
    let failures = u64::from(failures);
    let max = (500 + failures * 2000).min(RETRY_CAP_MS);
    let min = (failures.saturating_sub(1) * 2000).max(250).min(RETRY_CAP_MS);
    (min, max)
}

/// A random delay within [`retry_interval_bounds`].
pub fn retry_interval(failures: u32) -> Duration {
    let (min, max) = retry_interval_bounds(failures);
    let ms = if min < max {
        rand::rng().random_range(min..max)
    } else {
        min
    };
    Duration::from_millis(ms)
}

/// Exponential backoff with an upper bound and optional full jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// The undithered delay before retry number `attempt` (zero based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let ms = (self.initial_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(ms as u64)
    }

    /// The delay to wait before retry number `attempt`. With jitter the
    /// result is uniform in `[base / 2, base]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let half = base / 2;
        let spread = base - half;
        let extra = rand::rng().random_range(0..=spread.as_millis() as u64);
        half + Duration::from_millis(extra)
    }
}
