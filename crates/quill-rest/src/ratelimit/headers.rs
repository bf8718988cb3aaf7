//! Rate-limit response headers
//!
//! Extracts the structured rate-limit update the service attaches to REST
//! responses. Every field is individually optional; unparsable values are
//! treated as absent.

use reqwest::header::HeaderMap;
use std::time::Duration;

/// `X-RateLimit-Bucket`: opaque bucket id
pub const HEADER_BUCKET: &str = "x-ratelimit-bucket";
/// `X-RateLimit-Limit`: requests per window
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// `X-RateLimit-Remaining`: requests left in the current window
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// `X-RateLimit-Reset-After`: seconds (float) until the window resets
pub const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
/// `X-RateLimit-Global`: set when the response signals a global violation
pub const HEADER_GLOBAL: &str = "x-ratelimit-global";

/// Structured rate-limit update parsed from one response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    /// True iff the response indicates a global rate-limit violation
    pub global: bool,
}

impl RateLimitHeaders {
    /// Parse the rate-limit headers out of a response header map
    #[must_use]
    pub fn parse(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        Self {
            bucket: text(HEADER_BUCKET).map(String::from),
            limit: text(HEADER_LIMIT).and_then(|v| v.parse().ok()),
            remaining: text(HEADER_REMAINING).and_then(|v| v.parse().ok()),
            reset_after: text(HEADER_RESET_AFTER)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64),
            global: text(HEADER_GLOBAL)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(false),
        }
    }

    /// No rate-limit information was present; downstream treats this as a
    /// no-op
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bucket.is_none()
            && self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_after.is_none()
            && !self.global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn write(update: &RateLimitHeaders) -> HeaderMap {
        let mut map = HeaderMap::new();
        let mut put = |name: &'static str, value: String| {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(&value).unwrap(),
            );
        };
        if let Some(bucket) = &update.bucket {
            put(HEADER_BUCKET, bucket.clone());
        }
        if let Some(limit) = update.limit {
            put(HEADER_LIMIT, limit.to_string());
        }
        if let Some(remaining) = update.remaining {
            put(HEADER_REMAINING, remaining.to_string());
        }
        if let Some(reset_after) = update.reset_after {
            put(HEADER_RESET_AFTER, format!("{}", reset_after.as_secs_f64()));
        }
        if update.global {
            put(HEADER_GLOBAL, "true".to_string());
        }
        map
    }

    #[test]
    fn test_roundtrip_full() {
        let update = RateLimitHeaders {
            bucket: Some("abcd1234".to_string()),
            limit: Some(5),
            remaining: Some(3),
            reset_after: Some(Duration::from_millis(1500)),
            global: false,
        };
        assert_eq!(RateLimitHeaders::parse(&write(&update)), update);
    }

    #[test]
    fn test_roundtrip_global() {
        let update = RateLimitHeaders {
            bucket: None,
            limit: None,
            remaining: None,
            reset_after: Some(Duration::from_secs(2)),
            global: true,
        };
        assert_eq!(RateLimitHeaders::parse(&write(&update)), update);
    }

    #[test]
    fn test_empty_headers() {
        let parsed = RateLimitHeaders::parse(&HeaderMap::new());
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_garbage_values_treated_as_absent() {
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_static(HEADER_LIMIT),
            HeaderValue::from_static("not-a-number"),
        );
        map.insert(
            HeaderName::from_static(HEADER_RESET_AFTER),
            HeaderValue::from_static("NaN"),
        );
        let parsed = RateLimitHeaders::parse(&map);
        assert!(parsed.limit.is_none());
        assert!(parsed.reset_after.is_none());
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_float_reset_after() {
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_static(HEADER_RESET_AFTER),
            HeaderValue::from_static("0.421"),
        );
        let parsed = RateLimitHeaders::parse(&map);
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(421)));
    }
}
