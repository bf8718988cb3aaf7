//! Broker wire protocol
//!
//! Two service contracts share one framed channel: the rate-limit
//! coordinator (`Authorize`/`Update`) and the identify lock
//! (`Acquire`/`Renew`/`Release`).

use serde::{Deserialize, Serialize};

/// One request frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRequest {
    /// Correlates the response on a shared connection
    pub id: u64,
    #[serde(flatten)]
    pub call: Call,
}

/// The operation being requested
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    /// Equivalent of the local cache's `authorize`
    RateLimitAuthorize { method: String, path: String },
    /// Equivalent of the local cache's `update`
    RateLimitUpdate {
        method: String,
        path: String,
        global: bool,
        bucket: Option<String>,
        limit: Option<u32>,
        remaining: Option<u32>,
        reset_after_ms: Option<u64>,
    },
    /// Take the identify lock for `duration_ms`
    LockAcquire { duration_ms: u64 },
    /// Extend a held lease
    LockRenew { token: String, duration_ms: u64 },
    /// Give the lock back
    LockRelease { token: String },
}

/// One response frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerResponse {
    pub id: u64,
    pub result: Result<Reply, String>,
}

/// Successful reply payloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    /// Zero means proceed now
    Authorize { reset_after_ms: u64 },
    /// Operation done, nothing to report
    Unit,
    /// Lock decision; `token`/`expires_at_ms` set iff granted
    Lock {
        granted: bool,
        token: Option<String>,
        /// Unix epoch milliseconds
        expires_at_ms: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let request = BrokerRequest {
            id: 3,
            call: Call::RateLimitAuthorize {
                method: "POST".to_string(),
                path: "channels/1/messages".to_string(),
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["op"], "rate_limit_authorize");
        assert_eq!(json["method"], "POST");
    }

    #[test]
    fn test_call_roundtrip() {
        let calls = [
            Call::RateLimitUpdate {
                method: "GET".to_string(),
                path: "guilds/1".to_string(),
                global: true,
                bucket: Some("b".to_string()),
                limit: Some(5),
                remaining: Some(0),
                reset_after_ms: Some(1000),
            },
            Call::LockAcquire { duration_ms: 30_000 },
            Call::LockRenew {
                token: "t".to_string(),
                duration_ms: 30_000,
            },
            Call::LockRelease { token: "t".to_string() },
        ];
        for call in calls {
            let json = serde_json::to_string(&call).unwrap();
            let parsed: Call = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, call);
        }
    }

    #[test]
    fn test_error_response_roundtrip() {
        let response = BrokerResponse {
            id: 9,
            result: Err("unknown method".to_string()),
        };
        let json = serde_json::to_string(&response).unwrap();
        let parsed: BrokerResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 9);
        assert!(parsed.result.is_err());
    }
}
