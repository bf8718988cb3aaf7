//! Reconnect backoff

use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay with jitter
///
/// Doubles from the base on each failed attempt up to the cap; the actual
/// sleep is drawn uniformly from the upper half of the computed delay so
/// shards that died together do not reconnect together.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Delay to sleep before the next attempt
    pub fn next(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let half = exp / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
