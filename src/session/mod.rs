//! Session module - Pairing two players and running their match
//!
//! Sits on top of the transport: a [`Lobby`] finds and pairs a partner, then hands the
//! live connection to a [`Match`] played over request/response messages.

mod lobby;
mod play;

pub use lobby::*;
pub use play::*;

use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

use crate::discovery::ScanConfig;
use crate::network::{Dialer, Listener, NetworkConfig, Peer, PeerError, PeerSocket};
use crate::protocol::{Message, MessageKind, Tag};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("No partner connected")]
    NotPaired,

    #[error("{0} has no reply kind")]
    NoReply(Tag),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Settings shared by the lobby and the match it leads to
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub network: NetworkConfig,
    pub scan: ScanConfig,
    /// Chat lines kept before the oldest is dropped
    pub chat_capacity: usize,
    /// Upcoming pieces kept visible in the queue
    pub queue_preview: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            scan: ScanConfig::default(),
            chat_capacity: 100,
            queue_preview: 3,
        }
    }
}

/// How this side got its connection.
///
/// A role change replaces the whole socket; the previous one is dropped.
pub enum Role {
    Listener(Listener),
    Dialer(Dialer),
}

impl Role {
    pub fn listen(peer: Peer) -> Self {
        Role::Listener(Listener::new(peer))
    }

    pub fn dial(peer: Peer, config: &NetworkConfig) -> Self {
        Role::Dialer(Dialer::new(peer, config.connect_timeout()))
    }

    pub fn socket(&self) -> &dyn PeerSocket {
        match self {
            Role::Listener(listener) => listener,
            Role::Dialer(dialer) => dialer,
        }
    }

    pub fn peer(&self) -> &Peer {
        self.socket().peer()
    }

    pub fn is_listener(&self) -> bool {
        matches!(self, Role::Listener(_))
    }

    pub fn start(&self, addr: IpAddr, port: u16) {
        self.socket().start(addr, port)
    }

    /// Bound address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Role::Listener(listener) => listener.local_addr(),
            Role::Dialer(_) => None,
        }
    }
}

/// Build a reply message, falling back to an empty body if `body` cannot be encoded
fn reply<T: Serialize>(kind: MessageKind, body: &T) -> Message {
    Message::with_body(kind, body).unwrap_or_else(|e| {
        tracing::error!("Could not encode {:?} body: {}", kind, e);
        Message::empty(kind)
    })
}

/// Request over `peer` and wait for the paired reply kind, bounded by `deadline` when
/// one is configured
async fn call(peer: &Peer, message: Message, deadline: Option<Duration>) -> SessionResult<Message> {
    let expected = MessageKind::from_tag(message.tag)
        .and_then(MessageKind::reply)
        .ok_or(SessionError::NoReply(message.tag))?;
    let response = match deadline {
        Some(deadline) => peer.request_timeout(message, expected, deadline).await?,
        None => peer.request(message, expected).await?,
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_needs_request_kind() {
        let peer = Peer::new("solo");
        let result = call(&peer, Message::empty(MessageKind::ChatReply), None).await;
        assert!(matches!(result, Err(SessionError::NoReply(tag)) if tag == MessageKind::ChatReply.tag()));

        let result = call(&peer, Message::empty(MessageKind::Chat), None).await;
        assert!(matches!(result, Err(SessionError::Peer(PeerError::Disconnected))));
    }
}
