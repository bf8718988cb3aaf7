//! Gateway event types and the user-facing event record
//!
//! Dispatch names the core inspects get a parsed kind; everything else
//! forwards verbatim.

use serde_json::Value;

/// Synthetic event emitted when one shard finishes its startup window
pub const SHARD_STARTUP_COMPLETE: &str = "SHARD_STARTUP_COMPLETE";
/// Synthetic event emitted when the last shard finishes startup
pub const STARTUP_COMPLETE: &str = "STARTUP_COMPLETE";

/// Dispatch event names the core reads
///
/// Unknown names are forwarded untouched; only these participate in the
/// client's own state handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Session opened; carries the initial guild snapshot
    Ready,
    /// Session resumed; replayed dispatches follow
    Resumed,
    /// Guild available, joined, or created
    GuildCreate,
    /// Guild became unavailable or was left
    GuildDelete,
}

impl EventKind {
    /// Wire name of the event
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Resumed => "RESUMED",
            Self::GuildCreate => "GUILD_CREATE",
            Self::GuildDelete => "GUILD_DELETE",
        }
    }

    /// Parse a wire name; `None` for anything the core does not read
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "READY" => Some(Self::Ready),
            "RESUMED" => Some(Self::Resumed),
            "GUILD_CREATE" => Some(Self::GuildCreate),
            "GUILD_DELETE" => Some(Self::GuildDelete),
            _ => None,
        }
    }
}

/// One event delivered to the user sink
#[derive(Debug, Clone)]
pub struct Event {
    /// Shard the event arrived on
    pub shard_id: u16,
    /// Wire name, possibly rewritten by the user's remap
    pub name: String,
    /// Dispatch sequence; `None` on synthetic events
    pub seq: Option<u64>,
    /// Raw payload
    pub data: Value,
}

impl Event {
    /// Build a synthetic (non-dispatch) event
    #[must_use]
    pub fn synthetic(shard_id: u16, name: &str, data: Value) -> Self {
        Self {
            shard_id,
            name: name.to_string(),
            seq: None,
            data,
        }
    }

    /// Parsed kind, when the core reads this event
    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.name)
    }
}
