//! Per-route request queue
//!
//! Requests against one fingerprint are admitted strictly in submission
//! order; unrelated fingerprints never wait on each other. A queued request
//! whose deadline passes fails with `Deadline` even if a budget would free
//! it later.

use crate::client::RateLimiter;
use crate::routes::{Fingerprint, Route};
use dashmap::DashMap;
use quill_common::{ClientError, ClientResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

/// Ordered holding areas, one per fingerprint
///
/// The fairness of tokio's async mutex provides the FIFO: callers park on
/// the fingerprint's lock and wake in arrival order.
#[derive(Default)]
pub struct RouteQueues {
    queues: DashMap<Fingerprint, Arc<Mutex<()>>>,
}

impl RouteQueues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take this route's turn; resolves once every earlier caller released
    pub async fn acquire(&self, fingerprint: &Fingerprint) -> OwnedMutexGuard<()> {
        let queue = self
            .queues
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        queue.lock_owned().await
    }

    /// Wait until the limiter admits the route, or the deadline passes
    ///
    /// Re-checks `authorize` at each wake time the limiter reports.
    pub async fn admit(
        limiter: &dyn RateLimiter,
        route: &Route,
        deadline: Option<Instant>,
    ) -> ClientResult<()> {
        loop {
            let wait = limiter.authorize(route).await?;
            if wait.is_zero() {
                return Ok(());
            }

            let now = Instant::now();
            let wake = now + wait;
            match deadline {
                Some(deadline) if now >= deadline => {
                    return Err(ClientError::Deadline(Duration::ZERO));
                }
                Some(deadline) => {
                    let bound = wake.min(deadline);
                    tokio::time::sleep_until(bound).await;
                    if bound == deadline && Instant::now() >= deadline {
                        return Err(ClientError::Deadline(deadline - now));
                    }
                }
                None => tokio::time::sleep_until(wake).await,
            }
        }
    }
}
