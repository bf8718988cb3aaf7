//! # quill-broker
//!
//! Optional cross-process coordination: several bot processes sharing one
//! credential point their REST clients and identify gates at a broker
//! server, which owns the single rate-limit view and serializes identifies.
//!
//! The wire is a framed request/response protocol: 4-byte big-endian
//! length prefix, JSON body, over TCP.

pub mod client;
pub mod frame;
pub mod lock;
pub mod protocol;
pub mod server;

pub use client::BrokerClient;
pub use lock::LockRegistry;
pub use protocol::{BrokerRequest, BrokerResponse, Call, Reply};
pub use server::BrokerServer;
