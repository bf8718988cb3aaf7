//! Gateway wire protocol
//!
//! JSON envelope, operation codes, close-code policy, and the payloads the
//! client reads or writes.

mod close_codes;
mod messages;
mod opcodes;
mod payloads;

pub use close_codes::{CloseAction, CloseCode};
pub use messages::GatewayMessage;
pub use opcodes::OpCode;
pub use payloads::{
    Hello, Identify, IdentifyProperties, Ready, Resume, UnavailableGuild,
};
