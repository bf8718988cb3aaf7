//! Client configuration
//!
//! Programmatic configuration with environment-variable overrides.

use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Environment variable holding a comma-separated list of shard ids
pub const ENV_SHARD_IDS: &str = "QUILL_SHARD_IDS";

/// Environment variable holding the total shard count
pub const ENV_SHARD_COUNT: &str = "QUILL_SHARD_COUNT";

/// Top-level client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bot credential, normalized on use (see [`crate::token::normalize_token`])
    pub token: String,
    pub rest: RestConfig,
    pub gateway: GatewayConfig,
    /// Remote coordination; `None` runs fully local
    pub broker: Option<BrokerConfig>,
    pub shard_plan: ShardPlan,
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            rest: RestConfig::default(),
            gateway: GatewayConfig::default(),
            broker: None,
            shard_plan: ShardPlan::Auto,
        }
    }

    /// Apply environment overrides on top of the programmatic configuration
    ///
    /// When both `QUILL_SHARD_IDS` and `QUILL_SHARD_COUNT` are set they
    /// replace any shard plan supplied in code. A `.env` file is honored if
    /// present.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when either variable is present but malformed,
    /// or when only one of the pair is set.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let ids = env::var(ENV_SHARD_IDS).ok();
        let count = env::var(ENV_SHARD_COUNT).ok();

        match (ids, count) {
            (Some(ids), Some(count)) => {
                let count: u16 = count
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidVar(ENV_SHARD_COUNT))?;
                let ids = ids
                    .split(',')
                    .map(|s| s.trim().parse::<u16>())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| ConfigError::InvalidVar(ENV_SHARD_IDS))?;
                if ids.is_empty() {
                    return Err(ConfigError::InvalidVar(ENV_SHARD_IDS));
                }
                self.shard_plan = ShardPlan::Explicit { ids, count };
                Ok(self)
            }
            (None, None) => Ok(self),
            (Some(_), None) => Err(ConfigError::MissingVar(ENV_SHARD_COUNT)),
            (None, Some(_)) => Err(ConfigError::MissingVar(ENV_SHARD_IDS)),
        }
    }
}

/// How the cluster decides which shards to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPlan {
    /// Fetch both the count and the id range from the service
    Auto,
    /// Run all ids `0..count`
    CountOnly(u16),
    /// Run exactly these ids out of `count`
    Explicit { ids: Vec<u16>, count: u16 },
}

impl ShardPlan {
    /// Validate that every shard id fits the shard count
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidShardPlan`] if any id is out of range or
    /// the count is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Auto => Ok(()),
            Self::CountOnly(count) => {
                if *count == 0 {
                    return Err(ConfigError::InvalidShardPlan("shard count must be > 0".into()));
                }
                Ok(())
            }
            Self::Explicit { ids, count } => {
                if *count == 0 {
                    return Err(ConfigError::InvalidShardPlan("shard count must be > 0".into()));
                }
                if let Some(bad) = ids.iter().find(|id| **id >= *count) {
                    return Err(ConfigError::InvalidShardPlan(format!(
                        "shard id {bad} out of range for count {count}"
                    )));
                }
                Ok(())
            }
        }
    }
}

/// REST client configuration
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL of the service REST API
    pub base_url: String,
    /// How many times a request re-enters the queue after a 429 before
    /// failing with `RateLimitExhausted`
    pub max_rate_limit_retries: u32,
    /// Default per-request deadline; `None` waits indefinitely
    pub default_deadline: Option<Duration>,
    pub global_bucket: GlobalBucketConfig,
    /// Cadence of the bucket eviction sweep
    pub sweep_interval: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            max_rate_limit_retries: 5,
            default_deadline: None,
            global_bucket: GlobalBucketConfig::default(),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Process-wide request budget shared by every route
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GlobalBucketConfig {
    /// Requests permitted per window
    #[serde(default = "default_global_limit")]
    pub limit: u32,
    /// Sliding window length in milliseconds
    #[serde(default = "default_global_window_ms")]
    pub window_ms: u64,
}

impl Default for GlobalBucketConfig {
    fn default() -> Self {
        Self {
            limit: default_global_limit(),
            window_ms: default_global_window_ms(),
        }
    }
}

impl GlobalBucketConfig {
    /// Window as a [`Duration`]
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Gateway and orchestration configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket URL; fetched from the service when `None`
    pub url: Option<String>,
    /// Gateway API version appended to the URL
    pub api_version: u8,
    /// Enable `compress=zlib-stream` on the connection
    pub compress: bool,
    /// Intent bitfield sent with IDENTIFY
    pub intents: u64,
    /// Minimum gap between two IDENTIFY operations under one gate
    pub identify_gap: Duration,
    /// Lease on an identify ticket; doubles as the READY timeout
    pub identify_lease: Duration,
    /// The login loop refuses to dequeue before `start() + identify_guard`
    pub identify_guard: Duration,
    /// How long HELLO may take before the connection is treated as dead
    pub hello_timeout: Duration,
    /// Reconnect backoff ceiling
    pub backoff_cap: Duration,
    /// Stragglers tolerated when forcing startup completion; `None` disables
    /// the relaxation
    pub unavailable_guild_tolerance: Option<u32>,
    /// Quiet period after which a within-tolerance shard is forced complete
    pub unavailable_guild_wait: Duration,
    /// Deliver non-GUILD_CREATE events while a shard is still starting up
    pub allow_events_during_startup: bool,
    /// Rewrites applied to emitted event names
    pub event_remap: std::collections::HashMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_version: 10,
            compress: false,
            intents: 0,
            identify_gap: Duration::from_secs(5),
            identify_lease: Duration::from_secs(30),
            identify_guard: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(15),
            backoff_cap: Duration::from_secs(120),
            unavailable_guild_tolerance: None,
            unavailable_guild_wait: Duration::from_secs(10),
            allow_events_during_startup: false,
            event_remap: std::collections::HashMap::new(),
        }
    }
}

/// Remote coordination configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address of the broker server, e.g. `127.0.0.1:7450`
    pub addr: String,
    /// On rate-limit RPC failure, degrade to the local cache instead of
    /// surfacing the error
    pub ratelimit_fallback: bool,
    /// On identify-lock RPC failure, proceed with only the local gate
    pub identify_fallback: bool,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(&'static str),

    #[error("Invalid environment variable: {0}")]
    InvalidVar(&'static str),

    #[error("Invalid shard plan: {0}")]
    InvalidShardPlan(String),
}

fn default_base_url() -> String {
    "https://chat.example.com/api/v10".to_string()
}

fn default_global_limit() -> u32 {
    50
}

fn default_global_window_ms() -> u64 {
    1050
}
