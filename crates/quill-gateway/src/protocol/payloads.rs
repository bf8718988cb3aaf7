//! Gateway payload definitions
//!
//! The payload structures the client writes, plus the fields it reads out
//! of HELLO, READY, and INVALID_SESSION.

use serde::{Deserialize, Serialize};

/// Payload of op 10 (Hello)
///
/// Sent by the server immediately after connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds; zero is a protocol violation
    pub heartbeat_interval: u64,
}

/// Payload of op 2 (Identify)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    /// Normalized bot credential
    pub token: String,
    pub properties: IdentifyProperties,
    /// Intent bitfield
    pub intents: u64,
    /// `[shard_id, shard_count]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u16; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
}

/// Client connection properties sent with Identify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "quill".to_string(),
            device: "quill".to_string(),
        }
    }
}

/// Payload of op 6 (Resume)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    /// Last dispatch sequence received before the disconnect
    pub seq: u64,
}

/// Fields the client reads out of the READY dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    /// Gateway protocol version
    pub v: u8,
    pub session_id: String,
    /// Preferred URL for subsequent resumes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_gateway_url: Option<String>,
    /// Initial guild snapshot; all still unavailable at this point
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

/// One entry of READY's initial guild set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableGuild {
    pub id: String,
    #[serde(default = "default_unavailable")]
    pub unavailable: bool,
}

fn default_unavailable() -> bool {
    true
}
