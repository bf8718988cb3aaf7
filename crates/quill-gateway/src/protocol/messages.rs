//! Gateway message envelope
//!
//! Every frame in either direction is `{op, d, s, t}`; `s` and `t` are only
//! set on dispatches.

use super::{Hello, Identify, OpCode, Resume};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    /// Operation code
    pub op: OpCode,

    /// Event data payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,

    /// Sequence number (only on op=0 Dispatch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event type (only on op=0 Dispatch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    // === Client messages ===

    /// Heartbeat (op=1) carrying the last received sequence
    #[must_use]
    pub fn heartbeat(seq: Option<u64>) -> Self {
        Self {
            op: OpCode::Heartbeat,
            d: Some(seq.map_or(Value::Null, |s| Value::Number(s.into()))),
            s: None,
            t: None,
        }
    }

    /// Identify (op=2)
    #[must_use]
    pub fn identify(payload: &Identify) -> Self {
        Self {
            op: OpCode::Identify,
            d: serde_json::to_value(payload).ok(),
            s: None,
            t: None,
        }
    }

    /// Resume (op=6)
    #[must_use]
    pub fn resume(payload: &Resume) -> Self {
        Self {
            op: OpCode::Resume,
            d: serde_json::to_value(payload).ok(),
            s: None,
            t: None,
        }
    }

    /// Presence update (op=3) with a caller-built payload
    #[must_use]
    pub fn presence_update(payload: Value) -> Self {
        Self {
            op: OpCode::PresenceUpdate,
            d: Some(payload),
            s: None,
            t: None,
        }
    }

    /// Voice state update (op=4) with a caller-built payload
    #[must_use]
    pub fn voice_state_update(payload: Value) -> Self {
        Self {
            op: OpCode::VoiceStateUpdate,
            d: Some(payload),
            s: None,
            t: None,
        }
    }

    /// Request guild members (op=8) with a caller-built payload
    #[must_use]
    pub fn request_guild_members(payload: Value) -> Self {
        Self {
            op: OpCode::RequestGuildMembers,
            d: Some(payload),
            s: None,
            t: None,
        }
    }

    // === Server message accessors ===

    /// Parse as a Hello payload (op=10)
    #[must_use]
    pub fn as_hello(&self) -> Option<Hello> {
        if self.op != OpCode::Hello {
            return None;
        }
        self.d.as_ref().and_then(|d| serde_json::from_value(d.clone()).ok())
    }

    /// Parse the Invalid Session resumable flag (op=9)
    ///
    /// A missing or non-boolean payload reads as not resumable.
    #[must_use]
    pub fn as_invalid_session(&self) -> Option<bool> {
        if self.op != OpCode::InvalidSession {
            return None;
        }
        Some(self.d.as_ref().and_then(Value::as_bool).unwrap_or(false))
    }

    /// Dispatch accessors: `(event name, sequence, payload)`
    #[must_use]
    pub fn as_dispatch(&self) -> Option<(&str, u64, &Value)> {
        if self.op != OpCode::Dispatch {
            return None;
        }
        Some((self.t.as_deref()?, self.s?, self.d.as_ref()?))
    }

    // === Utilities ===

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl std::fmt::Display for GatewayMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(t) = &self.t {
            write!(f, "GatewayMessage(op={}, t={}", self.op, t)?;
            if let Some(s) = self.s {
                write!(f, ", s={s}")?;
            }
            write!(f, ")")
        } else {
            write!(f, "GatewayMessage(op={})", self.op)
        }
    }
}
