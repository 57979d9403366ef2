//! Protocol module - Defines the wire protocol spoken to the HIVE server
//!
//! A connection starts with a 4-byte magic number, after which every
//! message is a length-prefixed frame:
//! - 4 bytes body length (little-endian, see [`LengthPrefix`])
//! - Variable length body: a `State` table wrapping one or more entities

mod codec;
mod entity;
mod envelope;
mod table;

pub use codec::*;
pub use entity::*;
pub use envelope::*;
pub use table::{DecodeError, EncodeError};

/// Magic number announcing the protocol, written little-endian
pub const MAGIC_NUMBER: u32 = 0x23476945;

/// Default server port
pub const DEFAULT_PORT: u16 = 6000;

/// Default server host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Hex dump of the first `max` bytes, for frame logging
pub fn hex_preview(bytes: &[u8], max: usize) -> String {
    let shown: Vec<String> = bytes.iter().take(max).map(|b| format!("{:02X}", b)).collect();
    if bytes.len() > max {
        format!("{} ... and {} more bytes", shown.join(" "), bytes.len() - max)
    } else {
        shown.join(" ")
    }
}
