//! Budget templates
//!
//! Per-bucket defaults learned from observation. When a fingerprint maps to
//! a known bucket but the live budget has been evicted, the template
//! synthesizes an assumed budget so the route is not treated as unknown.

use super::{Bucket, RateLimitHeaders};
use dashmap::DashMap;
use std::time::Duration;

/// Most recently observed `(limit, reset_after)` pair for one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub limit: u32,
    pub reset_after: Duration,
}

/// Per-bucket template store
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: DashMap<String, Template>,
}

impl TemplateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the observed defaults from one response
    ///
    /// A no-op unless the headers carry a bucket id together with a limit
    /// and reset duration.
    pub fn upsert(&self, headers: &RateLimitHeaders) {
        let (Some(bucket), Some(limit), Some(reset_after)) =
            (&headers.bucket, headers.limit, headers.reset_after)
        else {
            return;
        };
        self.templates.insert(
            bucket.clone(),
            Template { limit, reset_after },
        );
    }

    /// Synthesize a fresh assumed budget for a known bucket
    ///
    /// This is the only mechanism that creates a budget before a response
    /// has arrived: `remaining = limit`, reset a full window out.
    #[must_use]
    pub fn create_assumed(&self, bucket_id: &str) -> Option<Bucket> {
        let template = *self.templates.get(bucket_id)?;
        Some(Bucket::new(
            bucket_id,
            template.limit,
            template.limit,
            template.reset_after,
        ))
    }

    #[must_use]
    pub fn get(&self, bucket_id: &str) -> Option<Template> {
        self.templates.get(bucket_id).map(|t| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(bucket: &str, limit: u32, reset_after_ms: u64) -> RateLimitHeaders {
        RateLimitHeaders {
            bucket: Some(bucket.to_string()),
            limit: Some(limit),
            remaining: Some(limit),
            reset_after: Some(Duration::from_millis(reset_after_ms)),
            global: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_and_assume() {
        let store = TemplateStore::new();
        store.upsert(&headers("b1", 5, 1000));

        let bucket = store.create_assumed("b1").expect("template exists");
        assert_eq!(bucket.limit(), 5);
        assert_eq!(bucket.remaining(), 5);
        assert_eq!(
            bucket.reset_in(tokio::time::Instant::now()),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_unknown_bucket_has_no_assumption() {
        let store = TemplateStore::new();
        assert!(store.create_assumed("nope").is_none());
    }

    #[test]
    fn test_upsert_overwrites() {
        let store = TemplateStore::new();
        store.upsert(&headers("b1", 5, 1000));
        store.upsert(&headers("b1", 2, 500));

        let template = store.get("b1").unwrap();
        assert_eq!(template.limit, 2);
        assert_eq!(template.reset_after, Duration::from_millis(500));
    }

    #[test]
    fn test_partial_headers_ignored() {
        let store = TemplateStore::new();
        store.upsert(&RateLimitHeaders {
            bucket: Some("b1".to_string()),
            limit: None,
            remaining: None,
            reset_after: Some(Duration::from_secs(1)),
            global: false,
        });
        assert!(store.get("b1").is_none());
    }
}
