//! Client error types
//!
//! Unified error taxonomy shared by the REST, gateway, and broker crates.

use std::time::Duration;

/// Result alias used throughout the client
pub type ClientResult<T> = Result<T, ClientError>;

/// Client-wide error type
///
/// Each variant corresponds to one failure class; shard-fatal variants can be
/// distinguished with [`ClientError::is_fatal`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid configuration (bad shard plan, missing token). Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network read/write, TLS, or DNS failure
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Malformed frame or an opcode where none is allowed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Repeated service-side rate limiting exhausted the retry budget
    #[error("Rate limit retries exhausted after {attempts} attempts")]
    RateLimitExhausted {
        /// How many times the request was answered with 429
        attempts: u32,
    },

    /// The service invalidated the current gateway session
    #[error("Session invalidated (resumable: {resumable})")]
    SessionInvalid {
        /// Whether the service indicated the session can still be resumed
        resumable: bool,
    },

    /// Authentication was rejected by the service
    #[error("Authentication failed")]
    AuthFailed,

    /// The shard id/count pair was rejected by the service
    #[error("Invalid shard")]
    InvalidShard,

    /// An intent was requested that the credential is not allowed to use
    #[error("Disallowed intent")]
    DisallowedIntent,

    /// A caller-imposed deadline elapsed while waiting
    #[error("Deadline of {0:?} elapsed")]
    Deadline(Duration),

    /// A remote coordination call failed and fallback was not permitted
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Invariant violation inside the client itself
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether this error is terminal for a shard (no reconnection attempted)
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed | Self::InvalidShard | Self::DisallowedIntent | Self::Config(_)
        )
    }

    /// Short machine-readable code for structured logging
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG",
            Self::Transport(_) => "TRANSPORT",
            Self::Protocol(_) => "PROTOCOL",
            Self::RateLimitExhausted { .. } => "RATE_LIMIT_EXHAUSTED",
            Self::SessionInvalid { .. } => "SESSION_INVALID",
            Self::AuthFailed => "AUTH_FAILED",
            Self::InvalidShard => "INVALID_SHARD",
            Self::DisallowedIntent => "DISALLOWED_INTENT",
            Self::Deadline(_) => "DEADLINE",
            Self::Rpc(_) => "RPC",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Wrap an arbitrary transport-level failure
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }
}
