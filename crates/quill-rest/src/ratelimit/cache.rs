//! Rate-limit cache
//!
//! Sole owner of budgets, templates, and the global window. Maps request
//! fingerprints to service buckets, decides whether a request proceeds now
//! or how long it must wait, and folds response headers back in.

use super::{Bucket, BucketUpdate, GlobalBucket, RateLimitHeaders, TemplateStore};
use crate::routes::{Fingerprint, Route};
use dashmap::DashMap;
use quill_common::{ClientResult, GlobalBucketConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Cache of per-route budgets observed from response headers
///
/// `authorize` and `update` serialize per bucket via the bucket's own lock;
/// the global window has its own. The sweeper evicts by map entry, so a
/// budget checked out by an in-flight `authorize` survives its eviction.
pub struct RateLimitCache {
    /// Fingerprint → service bucket id, learned from responses
    routes: DashMap<Fingerprint, String>,
    /// Bucket id → live budget
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    templates: TemplateStore,
    global: GlobalBucket,
}

impl RateLimitCache {
    #[must_use]
    pub fn new(global: GlobalBucketConfig) -> Self {
        Self {
            routes: DashMap::new(),
            buckets: DashMap::new(),
            templates: TemplateStore::new(),
            global: GlobalBucket::new(global),
        }
    }

    /// Decide whether a request may proceed now
    ///
    /// Returns zero when the request was admitted (and charged against both
    /// its bucket and the global window); otherwise the minimum time the
    /// caller must wait before asking again.
    pub async fn authorize(&self, route: &Route) -> ClientResult<Duration> {
        let now = Instant::now();

        let global_wait = self.global.peek(now).await;
        if !global_wait.is_zero() {
            return Ok(global_wait);
        }

        let fingerprint = route.fingerprint();
        let Some(bucket_id) = self.routes.get(&fingerprint).map(|r| r.clone()) else {
            // Unknown route: admit optimistically without charging the
            // global window, the response teaches us
            return Ok(Duration::ZERO);
        };

        let bucket = self.bucket_or_assumed(&bucket_id);
        let Some(bucket) = bucket else {
            // Bucket evicted and no template survives; treat as unknown
            return Ok(Duration::ZERO);
        };

        let mut bucket = bucket.lock().await;
        bucket.refresh_if_reset(now);
        if !bucket.has_remaining(now) {
            return Ok(bucket.reset_in(now));
        }

        // Both gates must pass before either is charged
        if let Err(wait) = self.global.try_acquire(now).await {
            return Ok(wait);
        }
        bucket.decrement()?;
        Ok(Duration::ZERO)
    }

    /// Fold one response's rate-limit headers back into the cache
    pub async fn update(&self, route: &Route, headers: &RateLimitHeaders) -> ClientResult<()> {
        if headers.is_empty() {
            return Ok(());
        }
        let now = Instant::now();

        if headers.global {
            let cooldown = headers.reset_after.unwrap_or(Duration::from_secs(1));
            self.global.trip(cooldown, now).await;
        }

        let Some(bucket_id) = &headers.bucket else {
            return Ok(());
        };

        let fingerprint = route.fingerprint();
        let newly_linked = self
            .routes
            .insert(fingerprint.clone(), bucket_id.clone())
            .as_deref()
            != Some(bucket_id.as_str());
        if newly_linked {
            tracing::debug!(
                fingerprint = %fingerprint,
                bucket = %bucket_id,
                "route linked to bucket"
            );
        }

        self.templates.upsert(headers);

        let (Some(limit), Some(remaining), Some(reset_after)) =
            (headers.limit, headers.remaining, headers.reset_after)
        else {
            return Ok(());
        };
        let update = BucketUpdate {
            limit,
            remaining,
            reset_after,
        };

        let entry = self
            .buckets
            .entry(bucket_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket::new(
                    bucket_id.clone(),
                    limit,
                    remaining,
                    reset_after,
                )))
            })
            .clone();

        entry.lock().await.assign_if_stricter(&update, now);
        Ok(())
    }

    /// Spawn the periodic eviction sweep
    ///
    /// Budgets whose expiry passed are removed; their route links follow.
    /// Templates are retained so a returning route starts from an assumed
    /// budget rather than an unknown one.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval is immediate
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.sweep(Instant::now());
            }
        })
    }

    /// Evict expired budgets and dangling route links
    pub fn sweep(&self, now: Instant) {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| match bucket.try_lock() {
            Ok(bucket) => !bucket.is_expired(now),
            // A locked bucket is mid-authorize; never evict it
            Err(_) => true,
        });
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            self.routes
                .retain(|_, bucket_id| self.buckets.contains_key(bucket_id));
            tracing::debug!(evicted, "rate-limit sweep evicted idle budgets");
        }
    }

    /// Look up the live budget, or synthesize one from its template
    fn bucket_or_assumed(&self, bucket_id: &str) -> Option<Arc<Mutex<Bucket>>> {
        if let Some(bucket) = self.buckets.get(bucket_id) {
            return Some(bucket.clone());
        }
        let assumed = self.templates.create_assumed(bucket_id)?;
        Some(
            self.buckets
                .entry(bucket_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(assumed)))
                .clone(),
        )
    }

    /// Number of live budgets (exposed for tests and introspection)
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
