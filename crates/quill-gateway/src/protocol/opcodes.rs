//! Gateway operation codes

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Gateway operation codes
///
/// Op codes define the type of message moving over the WebSocket
/// connection, in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server pushes an event (server only)
    Dispatch = 0,
    /// Keep-alive ping carrying the last sequence (client; server may request one)
    Heartbeat = 1,
    /// Open a new session (client only)
    Identify = 2,
    /// Update presence (client only)
    PresenceUpdate = 3,
    /// Join/leave a voice channel (client only)
    VoiceStateUpdate = 4,
    /// Reopen an existing session (client only)
    Resume = 6,
    /// Server asks the client to reconnect (server only)
    Reconnect = 7,
    /// Request guild member chunks (client only)
    RequestGuildMembers = 8,
    /// The session is invalid; payload says whether it can be resumed (server only)
    InvalidSession = 9,
    /// First message after connect, carries the heartbeat interval (server only)
    Hello = 10,
    /// Heartbeat acknowledged (server only)
    HeartbeatAck = 11,
}

impl OpCode {
    /// Create an `OpCode` from a raw integer value
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Get the raw integer value
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this op code is ever sent by the client
    #[must_use]
    pub const fn is_client_op(self) -> bool {
        matches!(
            self,
            Self::Heartbeat
                | Self::Identify
                | Self::PresenceUpdate
                | Self::VoiceStateUpdate
                | Self::Resume
                | Self::RequestGuildMembers
        )
    }

    /// Whether this op code is ever sent by the server
    #[must_use]
    pub const fn is_server_op(self) -> bool {
        matches!(
            self,
            Self::Dispatch
                | Self::Heartbeat
                | Self::Reconnect
                | Self::InvalidSession
                | Self::Hello
                | Self::HeartbeatAck
        )
    }

    /// Name of this op code
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::PresenceUpdate => "PresenceUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestGuildMembers => "RequestGuildMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }
}

impl Serialize for OpCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for OpCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value).ok_or_else(|| serde::de::Error::custom(format!("invalid op code: {value}")))
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_from_u8() {
        assert_eq!(OpCode::from_u8(0), Some(OpCode::Dispatch));
        assert_eq!(OpCode::from_u8(4), Some(OpCode::VoiceStateUpdate));
        assert_eq!(OpCode::from_u8(6), Some(OpCode::Resume));
        assert_eq!(OpCode::from_u8(8), Some(OpCode::RequestGuildMembers));
        assert_eq!(OpCode::from_u8(9), Some(OpCode::InvalidSession));
        assert_eq!(OpCode::from_u8(11), Some(OpCode::HeartbeatAck));
        // 5 is a hole in the numbering
        assert_eq!(OpCode::from_u8(5), None);
        assert_eq!(OpCode::from_u8(255), None);
    }

    #[test]
    fn test_direction_classification() {
        assert!(OpCode::Identify.is_client_op());
        assert!(OpCode::Resume.is_client_op());
        assert!(OpCode::RequestGuildMembers.is_client_op());
        assert!(!OpCode::Identify.is_server_op());

        assert!(OpCode::Hello.is_server_op());
        assert!(OpCode::InvalidSession.is_server_op());
        assert!(!OpCode::Hello.is_client_op());

        // Heartbeat flows both ways
        assert!(OpCode::Heartbeat.is_client_op());
        assert!(OpCode::Heartbeat.is_server_op());
    }

    #[test]
    fn test_opcode_serialization() {
        let json = serde_json::to_string(&OpCode::Hello).unwrap();
        assert_eq!(json, "10");

        let op: OpCode = serde_json::from_str("6").unwrap();
        assert_eq!(op, OpCode::Resume);
    }
}
