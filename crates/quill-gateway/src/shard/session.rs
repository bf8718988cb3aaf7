//! Shard session state

/// Connection phase of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardPhase {
    /// Created, not yet logging in
    Idle,
    /// Opening the WebSocket
    Connecting,
    /// Waiting for the server's HELLO
    AwaitingHello,
    /// Waiting for an identify ticket
    AwaitingIdentify,
    /// IDENTIFY sent, waiting for READY
    Identifying,
    /// RESUME sent, waiting for the replay to finish
    Resuming,
    /// Normal dispatch
    Active,
    /// Sleeping before a reconnect attempt
    Backoff,
    /// Terminal; no further reconnection
    Dead,
}

impl ShardPhase {
    /// Whether the shard currently occupies the identify pipeline
    #[must_use]
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::Identifying | Self::Resuming)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::AwaitingHello => "AwaitingHello",
            Self::AwaitingIdentify => "AwaitingIdentify",
            Self::Identifying => "Identifying",
            Self::Resuming => "Resuming",
            Self::Active => "Active",
            Self::Backoff => "Backoff",
            Self::Dead => "Dead",
        }
    }
}

impl std::fmt::Display for ShardPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resume state one shard carries across reconnects
#[derive(Debug, Clone, Default)]
pub struct ShardSession {
    session_id: Option<String>,
    seq: Option<u64>,
    resume_url: Option<String>,
}

impl ShardSession {
    /// Adopt a fresh session from READY
    pub fn open(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
    }

    /// Record a dispatch sequence; only dispatches advance it
    pub fn record_seq(&mut self, seq: u64) {
        self.seq = Some(seq);
    }

    /// Last recorded dispatch sequence
    #[must_use]
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    /// URL preferred for resuming, when the service supplied one
    #[must_use]
    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// The `(session_id, seq)` pair needed to RESUME, if any
    #[must_use]
    pub fn resumable(&self) -> Option<(&str, u64)> {
        Some((self.session_id.as_deref()?, self.seq?))
    }

    /// Drop the session entirely; the next connection identifies afresh
    pub fn clear(&mut self) {
        self.session_id = None;
        self.seq = None;
        self.resume_url = None;
    }
}
