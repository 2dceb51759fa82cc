//! Protocol module - Defines the wire protocol between two Duotris peers
//!
//! Every envelope on the wire is a `(tag, body)` pair framed as:
//! - 4 bytes magic
//! - 4 bytes tag (signed, big-endian)
//! - 4 bytes payload length (big-endian)
//! - 4 bytes sequence number (big-endian)
//! - Variable length JSON payload

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Protocol version, reported by `duotris info`
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for Duotris communication
pub const DEFAULT_PORT: u16 = 4321;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x44, 0x55, 0x4F, 0x54]; // "DUOT"
