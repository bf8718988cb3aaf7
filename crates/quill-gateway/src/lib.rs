//! # quill-gateway
//!
//! Persistent event-stream connections to the chat-platform service:
//! per-shard WebSocket state machines, the cross-shard identify gate, and
//! the cluster orchestrator with its startup policy and event fan-out.

pub mod cluster;
pub mod compression;
pub mod events;
pub mod identify;
pub mod protocol;
pub mod shard;

pub use cluster::Cluster;
pub use events::{Event, EventKind, SHARD_STARTUP_COMPLETE, STARTUP_COMPLETE};
pub use identify::{IdentifyGate, IdentifyLock, IdentifyTicket, RemoteGate, RemoteLease};
pub use shard::{Backoff, Shard, ShardPhase, ShardSession};
