//! Network module - The pairwise request/response transport
//!
//! Provides:
//! - [`Peer`], the socket core with `request` / `enroll` over one stream
//! - [`Listener`], which accepts the connection
//! - [`Dialer`], which initiates it
//! - [`PeerSocket`], the surface both roles share

mod connection;
mod dialer;
mod listener;
mod peer;

pub use connection::*;
pub use dialer::*;
pub use listener::*;
pub use peer::*;

use std::net::IpAddr;
use std::time::Duration;

/// Runtime settings for the transport
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port to listen on or connect to
    pub port: u16,
    /// Address the listener binds
    pub bind_address: IpAddr,
    /// Connection attempt timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Deadline for application requests; `None` waits as long as the connection lives
    pub request_timeout_ms: Option<u64>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            connect_timeout_ms: 500,
            request_timeout_ms: None,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// What the two connection roles have in common.
///
/// `start` only schedules background work and returns immediately; callers observe
/// progress through `is_connecting` and the peer's name/connection state.
pub trait PeerSocket {
    fn peer(&self) -> &Peer;

    /// Begin listening on / dialing `(addr, port)`. A no-op while already underway.
    fn start(&self, addr: IpAddr, port: u16);

    fn is_connecting(&self) -> bool;

    fn is_connected(&self) -> bool {
        self.peer().is_connected()
    }

    fn peer_name(&self) -> Option<String> {
        self.peer().peer_name()
    }

    fn kill(&self) {
        self.peer().kill()
    }
}
