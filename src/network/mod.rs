//! Network module - Handles the TCP link to the HIVE server
//!
//! Provides:
//! - Session for the socket, handshake and outbound frames
//! - Listener for decoding inbound frames on a background task
//! - Client tying both together under one shutdown signal

mod client;
mod listener;
mod session;
mod shutdown;

pub use client::*;
pub use listener::*;
pub use session::*;
pub use shutdown::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::protocol::LengthPrefix;

/// Runtime settings for a connection
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// How long a partially received frame may stall
    pub read_timeout: Duration,
    /// Length prefix convention for both directions
    pub length_prefix: LengthPrefix,
    /// Capacity of the inbound event channel
    pub event_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(2000),
            length_prefix: LengthPrefix::default(),
            event_capacity: 256,
        }
    }
}

impl From<&ConnectionConfig> for NetworkConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            length_prefix: config.length_prefix,
            ..Default::default()
        }
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
