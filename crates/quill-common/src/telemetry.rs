//! Log sink setup
//!
//! Every quill crate emits structured `tracing` events under its own
//! target: gateway traffic under `quill_gateway`, REST and rate limiting
//! under `quill_rest`, client plumbing under `quill_common`, and broker
//! RPC under `quill_broker`. The subscriber built here filters per source
//! on top of a baseline level; a set `RUST_LOG` always wins.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Where a log event originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogSource {
    /// Shard connections, the identify gate, and orchestration
    Gateway,
    /// REST requests and the rate-limit engine
    Api,
    /// Configuration and credential handling
    Client,
    /// Broker RPC, both client and server side
    Rpc,
}

impl LogSource {
    /// Every source, in display order
    pub const ALL: [Self; 4] = [Self::Gateway, Self::Api, Self::Client, Self::Rpc];

    /// The `tracing` target prefix this source logs under
    #[must_use]
    pub const fn target(self) -> &'static str {
        match self {
            Self::Gateway => "quill_gateway",
            Self::Api => "quill_rest",
            Self::Client => "quill_common",
            Self::Rpc => "quill_broker",
        }
    }

    /// Uppercase wire name of the source
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gateway => "GATEWAY",
            Self::Api => "API",
            Self::Client => "CLIENT",
            Self::Rpc => "RPC",
        }
    }
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscriber configuration: a baseline level plus per-source overrides
///
/// `TelemetryConfig::new(Level::INFO).source(LogSource::Gateway, Level::DEBUG)`
/// keeps the process quiet while one source is under investigation.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    baseline: Level,
    json: bool,
    overrides: Vec<(LogSource, Level)>,
}

impl TelemetryConfig {
    /// Log everything at `baseline` unless a source override says otherwise
    #[must_use]
    pub fn new(baseline: Level) -> Self {
        Self {
            baseline,
            json: false,
            overrides: Vec::new(),
        }
    }

    /// Raise or lower one source's level; the last call per source wins
    #[must_use]
    pub fn source(mut self, source: LogSource, level: Level) -> Self {
        self.overrides.retain(|(s, _)| *s != source);
        self.overrides.push((source, level));
        self
    }

    /// Emit JSON lines instead of human-readable output
    #[must_use]
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    /// The filter directives this configuration expands to
    ///
    /// Same syntax as `RUST_LOG`, e.g. `INFO,quill_gateway=DEBUG`.
    #[must_use]
    pub fn directives(&self) -> String {
        let mut directives = self.baseline.to_string();
        for (source, level) in &self.overrides {
            directives.push_str(&format!(",{}={}", source.target(), level));
        }
        directives
    }
}

/// Install the process-wide log subscriber
///
/// # Panics
/// Panics if a global subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) {
    try_init_telemetry(config).expect("a global log subscriber is already installed");
}

/// Install the subscriber, reporting instead of panicking when one exists
pub fn try_init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));
    let format = if config.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
        .map_err(|_| TelemetryError::SubscriberInstalled)
}

/// Telemetry setup errors
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("a global log subscriber is already installed")]
    SubscriberInstalled,
}
