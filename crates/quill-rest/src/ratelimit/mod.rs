//! Rate-limit engine
//!
//! Budgets are learned entirely from response headers: the cache maps route
//! fingerprints to service-assigned buckets, folds header updates
//! tighten-only, and gates every request behind both its bucket and the
//! process-wide global window.

mod bucket;
mod cache;
mod global;
mod headers;
mod templates;

pub use bucket::{Bucket, BucketUpdate};
pub use cache::RateLimitCache;
pub use global::GlobalBucket;
pub use headers::RateLimitHeaders;
pub use templates::{Template, TemplateStore};
