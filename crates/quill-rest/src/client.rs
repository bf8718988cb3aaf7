//! REST client
//!
//! Serializes each request through the per-route queue and the rate-limit
//! engine, performs the HTTP transport, and feeds response headers back.
//! Transport failures surface to the caller untouched; only service-side
//! rate limiting (429) re-queues a request, up to a configured cap.

use crate::queue::RouteQueues;
use crate::ratelimit::{RateLimitCache, RateLimitHeaders};
use crate::routes::{Method, Route};
use async_trait::async_trait;
use quill_common::{normalize_token, ClientError, ClientResult, RestConfig};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The rate-limit decision seam
///
/// Implemented by the local [`RateLimitCache`] and by remote coordinators;
/// the client only ever talks to this trait.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Zero means proceed now; otherwise the minimum wait before re-asking
    async fn authorize(&self, route: &Route) -> ClientResult<Duration>;

    /// Fold one response's rate-limit headers back in
    async fn update(&self, route: &Route, headers: &RateLimitHeaders) -> ClientResult<()>;
}

#[async_trait]
impl RateLimiter for RateLimitCache {
    async fn authorize(&self, route: &Route) -> ClientResult<Duration> {
        RateLimitCache::authorize(self, route).await
    }

    async fn update(&self, route: &Route, headers: &RateLimitHeaders) -> ClientResult<()> {
        RateLimitCache::update(self, route, headers).await
    }
}

/// A remote coordinator with optional degradation to the local cache
pub struct CoordinatedLimiter {
    remote: Arc<dyn RateLimiter>,
    local: Arc<RateLimitCache>,
    allow_fallback: bool,
}

impl CoordinatedLimiter {
    #[must_use]
    pub fn new(
        remote: Arc<dyn RateLimiter>,
        local: Arc<RateLimitCache>,
        allow_fallback: bool,
    ) -> Self {
        Self {
            remote,
            local,
            allow_fallback,
        }
    }
}

#[async_trait]
impl RateLimiter for CoordinatedLimiter {
    async fn authorize(&self, route: &Route) -> ClientResult<Duration> {
        match self.remote.authorize(route).await {
            Ok(wait) => Ok(wait),
            Err(err) if self.allow_fallback => {
                tracing::warn!(error = %err, "coordinator authorize failed, using local cache");
                self.local.authorize(route).await
            }
            Err(err) => Err(err),
        }
    }

    async fn update(&self, route: &Route, headers: &RateLimitHeaders) -> ClientResult<()> {
        match self.remote.update(route, headers).await {
            Ok(()) => Ok(()),
            Err(err) if self.allow_fallback => {
                tracing::warn!(error = %err, "coordinator update failed, using local cache");
                self.local.update(route, headers).await
            }
            Err(err) => Err(err),
        }
    }
}

/// One REST request
#[derive(Debug, Clone)]
pub struct Request {
    pub route: Route,
    pub body: Option<Value>,
    /// Overrides the configured default deadline for queue waiting
    pub deadline: Option<Duration>,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            route: Route::new(method, path),
            body: None,
            deadline: None,
        }
    }

    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// One REST response
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    body: Vec<u8>,
}

impl Response {
    /// Raw body bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// Deserialize the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> ClientResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ClientError::Protocol(format!("malformed response body: {e}")))
    }

    /// Whether the status is a success (2xx)
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Recommended gateway connection parameters from the service
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    pub shards: u16,
    pub session_start_limit: SessionStartLimit,
}

/// Identify budget reported alongside the gateway URL
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}

/// Rate-limited REST client
pub struct RestClient {
    http: reqwest::Client,
    config: RestConfig,
    token: String,
    limiter: Arc<dyn RateLimiter>,
    queues: RouteQueues,
    /// Kept even when a coordinator fronts it, as the fallback target
    local_cache: Arc<RateLimitCache>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Drop for RestClient {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

impl RestClient {
    /// Create a client backed by a purely local rate-limit cache
    pub fn new(token: &str, config: RestConfig) -> ClientResult<Self> {
        let local_cache = Arc::new(RateLimitCache::new(config.global_bucket));
        Self::build(token, config, local_cache.clone(), local_cache)
    }

    /// Create a client that consults a remote coordinator first
    ///
    /// `allow_fallback` degrades coordinator failures to the local cache;
    /// otherwise they surface to the caller as [`ClientError::Rpc`].
    pub fn with_coordinator(
        token: &str,
        config: RestConfig,
        remote: Arc<dyn RateLimiter>,
        allow_fallback: bool,
    ) -> ClientResult<Self> {
        let local_cache = Arc::new(RateLimitCache::new(config.global_bucket));
        let limiter = Arc::new(CoordinatedLimiter::new(
            remote,
            local_cache.clone(),
            allow_fallback,
        ));
        Self::build(token, config, limiter, local_cache)
    }

    fn build(
        token: &str,
        config: RestConfig,
        limiter: Arc<dyn RateLimiter>,
        local_cache: Arc<RateLimitCache>,
    ) -> ClientResult<Self> {
        if token.trim().is_empty() {
            return Err(ClientError::Config("missing token".into()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(ClientError::transport)?;
        let sweeper = local_cache.start_sweeper(config.sweep_interval);

        Ok(Self {
            http,
            config,
            token: normalize_token(token),
            limiter,
            queues: RouteQueues::new(),
            local_cache,
            sweeper,
        })
    }

    /// The local rate-limit cache (also what a broker server would share)
    #[must_use]
    pub fn cache(&self) -> Arc<RateLimitCache> {
        self.local_cache.clone()
    }

    /// Issue a request through the rate-limit engine
    ///
    /// Requests on one fingerprint run in submission order. A 429 response
    /// re-queues the request once per 429 until the retry cap, then fails
    /// with `RateLimitExhausted`. Transport errors are not retried.
    pub async fn request(&self, request: Request) -> ClientResult<Response> {
        let route = request.route.clone();
        let fingerprint = route.fingerprint();
        let deadline = request
            .deadline
            .or(self.config.default_deadline)
            .map(|d| Instant::now() + d);

        let _turn = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.queues.acquire(&fingerprint))
                .await
                .map_err(|_| ClientError::Deadline(Duration::ZERO))?,
            None => self.queues.acquire(&fingerprint).await,
        };

        let mut attempts_429 = 0u32;
        loop {
            RouteQueues::admit(self.limiter.as_ref(), &route, deadline).await?;

            let response = self.transport(&request).await?;
            let headers = RateLimitHeaders::parse(response.headers());
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(ClientError::transport)?
                .to_vec();

            self.limiter.update(&route, &headers).await?;

            if status == 429 {
                attempts_429 += 1;
                tracing::warn!(
                    route = %route,
                    attempt = attempts_429,
                    "rate limited by the service"
                );
                if attempts_429 > self.config.max_rate_limit_retries {
                    return Err(ClientError::RateLimitExhausted {
                        attempts: attempts_429,
                    });
                }
                continue;
            }

            if !(200..300).contains(&status) {
                tracing::error!(route = %route, status, "request failed");
            }
            return Ok(Response { status, body });
        }
    }

    /// Fetch the recommended gateway URL and shard count
    pub async fn get_gateway_bot(&self) -> ClientResult<GatewayBot> {
        let response = self.request(Request::new(Method::Get, "gateway/bot")).await?;
        if !response.is_success() {
            return Err(ClientError::Protocol(format!(
                "gateway/bot returned status {}",
                response.status
            )));
        }
        response.json()
    }

    async fn transport(&self, request: &Request) -> ClientResult<reqwest::Response> {
        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            request.route.path
        );
        let mut builder = self
            .http
            .request(request.route.method.into(), &url)
            .header(reqwest::header::AUTHORIZATION, &self.token);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder.send().await.map_err(ClientError::transport)
    }
}
