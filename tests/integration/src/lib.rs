//! Shared fixtures for the scenario tests

mod mock_gateway;

pub use mock_gateway::{GatewayConn, MockGateway};

use quill_common::{ClientConfig, GatewayConfig, ShardPlan};
use std::time::Duration;

/// A client configuration pointed at a mock gateway, tuned for test speed
#[must_use]
pub fn test_config(gateway_url: &str, shard_ids: Vec<u16>, shard_count: u16) -> ClientConfig {
    let mut config = ClientConfig::new("test-token");
    config.shard_plan = ShardPlan::Explicit {
        ids: shard_ids,
        count: shard_count,
    };
    config.gateway = GatewayConfig {
        url: Some(gateway_url.to_string()),
        identify_guard: Duration::ZERO,
        identify_gap: Duration::from_millis(500),
        identify_lease: Duration::from_secs(30),
        hello_timeout: Duration::from_secs(10),
        backoff_cap: Duration::from_secs(2),
        ..GatewayConfig::default()
    };
    config
}
