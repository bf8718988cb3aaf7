//! # quill-common
//!
//! Shared configuration, error handling, telemetry, and credential utilities.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod token;

// Re-export commonly used types at crate root
pub use config::{
    BrokerConfig, ClientConfig, ConfigError, GatewayConfig, GlobalBucketConfig, RestConfig,
    ShardPlan, ENV_SHARD_COUNT, ENV_SHARD_IDS,
};
pub use error::{ClientError, ClientResult};
pub use telemetry::{
    init_telemetry, try_init_telemetry, LogSource, TelemetryConfig, TelemetryError,
};
pub use token::normalize_token;
