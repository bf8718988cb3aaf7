//! Per-route budget
//!
//! One live counter for a service-assigned bucket. Header updates fold in
//! tighten-only; scheduling uses the monotonic clock so wall-clock jumps
//! cannot stall or flood a route.

use quill_common::{ClientError, ClientResult};
use std::time::Duration;
use tokio::time::Instant;

/// Header-derived state folded into a [`Bucket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketUpdate {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

/// A single route budget: the live counter for one service bucket
#[derive(Debug, Clone)]
pub struct Bucket {
    id: String,
    limit: u32,
    remaining: u32,
    /// Start of the next window
    reset_at: Instant,
    /// Window length last observed, used to roll the budget forward once the
    /// reset passes without a new response
    reset_after: Duration,
    /// Past this point an idle budget may be evicted
    expires_at: Instant,
}

impl Bucket {
    /// Create a budget from its first observed (or assumed) state
    #[must_use]
    pub fn new(id: impl Into<String>, limit: u32, remaining: u32, reset_after: Duration) -> Self {
        let now = Instant::now();
        let limit = limit.max(1);
        Self {
            id: id.into(),
            limit,
            remaining: remaining.min(limit),
            reset_at: now + reset_after,
            reset_after,
            expires_at: now + reset_after * 3,
        }
    }

    /// Opaque service-assigned bucket id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Whether a request may be charged right now
    #[must_use]
    pub fn has_remaining(&self, now: Instant) -> bool {
        self.remaining > 0 || now >= self.reset_at
    }

    /// Time until the window resets; zero once the reset has passed
    #[must_use]
    pub fn reset_in(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }

    /// Whether the sweep may evict this budget
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Roll the budget into a fresh assumed window once the reset passed
    ///
    /// The real window is only known from the next response; until then the
    /// last observed `reset_after` stands in.
    pub fn refresh_if_reset(&mut self, now: Instant) {
        if now >= self.reset_at && self.remaining < self.limit {
            self.remaining = self.limit;
            self.reset_at = now + self.reset_after;
        }
    }

    /// Charge one request against the budget
    ///
    /// The charge is unconditional once granted: it stands even if the
    /// request later fails. Charging an empty budget is a gating bug in the
    /// caller and surfaces as [`ClientError::Internal`].
    pub fn decrement(&mut self) -> ClientResult<()> {
        if self.remaining == 0 {
            tracing::error!(bucket = %self.id, "budget charged at zero remaining");
            return Err(ClientError::Internal(format!(
                "bucket {} decremented at zero remaining",
                self.id
            )));
        }
        self.remaining -= 1;
        Ok(())
    }

    /// Fold a header-derived state into the budget, tighten-only
    ///
    /// A later reset starts a new window and adopts the reported remaining;
    /// within the same window the lower remaining wins and the reset never
    /// moves backward.
    pub fn assign_if_stricter(&mut self, update: &BucketUpdate, now: Instant) {
        self.limit = update.limit.max(1);
        self.reset_after = update.reset_after;

        let new_reset = now + update.reset_after;
        if new_reset > self.reset_at {
            self.reset_at = new_reset;
            self.remaining = update.remaining.min(self.limit);
        } else {
            self.remaining = self.remaining.min(update.remaining).min(self.limit);
        }
        self.expires_at = self.reset_at + update.reset_after * 2;
    }
}
