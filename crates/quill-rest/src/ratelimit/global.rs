//! Global request bucket
//!
//! A process-wide sliding window, independent of per-route budgets. A
//! request proceeds only if both its bucket and this window permit. A
//! service-signaled global violation trips the window into a cool-down.

use quill_common::GlobalBucketConfig;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct GlobalState {
    grants: VecDeque<Instant>,
    tripped_until: Option<Instant>,
}

/// Process-wide sliding-window token bucket
#[derive(Debug)]
pub struct GlobalBucket {
    limit: usize,
    window: Duration,
    state: Mutex<GlobalState>,
}

impl GlobalBucket {
    #[must_use]
    pub fn new(config: GlobalBucketConfig) -> Self {
        Self {
            limit: config.limit.max(1) as usize,
            window: config.window(),
            state: Mutex::new(GlobalState {
                grants: VecDeque::new(),
                tripped_until: None,
            }),
        }
    }

    /// Time until the window would admit a request; zero if it would now
    ///
    /// Does not consume a slot.
    pub async fn peek(&self, now: Instant) -> Duration {
        let mut state = self.state.lock().await;
        self.wait_for(&mut state, now)
    }

    /// Consume one slot, or report how long until one frees
    pub async fn try_acquire(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock().await;
        let wait = self.wait_for(&mut state, now);
        if !wait.is_zero() {
            return Err(wait);
        }
        state.grants.push_back(now);
        Ok(())
    }

    /// Enter a cool-down after a service-signaled global violation
    pub async fn trip(&self, cooldown: Duration, now: Instant) {
        let mut state = self.state.lock().await;
        let until = now + cooldown;
        // A shorter trip never shortens an ongoing one
        if state.tripped_until.map_or(true, |t| t < until) {
            state.tripped_until = Some(until);
        }
        tracing::warn!(cooldown_ms = cooldown.as_millis() as u64, "global rate limit tripped");
    }

    fn wait_for(&self, state: &mut GlobalState, now: Instant) -> Duration {
        if let Some(until) = state.tripped_until {
            if now < until {
                return until - now;
            }
            state.tripped_until = None;
        }

        while let Some(front) = state.grants.front() {
            if now.saturating_duration_since(*front) >= self.window {
                state.grants.pop_front();
            } else {
                break;
            }
        }

        if state.grants.len() < self.limit {
            Duration::ZERO
        } else {
            // Oldest grant leaving the window frees the next slot
            (*state.grants.front().expect("non-empty at limit") + self.window) - now
        }
    }
}
