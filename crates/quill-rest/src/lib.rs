//! # quill-rest
//!
//! REST client with a header-driven rate-limit engine.
//!
//! Requests flow through a per-route queue, the rate-limit cache, and the
//! HTTP transport; response headers feed budgets back into the cache.

pub mod client;
pub mod queue;
pub mod ratelimit;
pub mod routes;

pub use client::{
    CoordinatedLimiter, GatewayBot, RateLimiter, Request, Response, RestClient,
    SessionStartLimit,
};
pub use queue::RouteQueues;
pub use ratelimit::{Bucket, GlobalBucket, RateLimitCache, RateLimitHeaders, TemplateStore};
pub use routes::{Fingerprint, Method, Route};
