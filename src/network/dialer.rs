//! Dialing side of a pairing
//!
//! Opens the connection to a listener in the background. A failed attempt (refused
//! or timed out) quietly leaves the dialer idle; callers poll its state.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use super::{Peer, PeerSocket};

pub struct Dialer {
    peer: Peer,
    /// Set from `start` until the attempt fails or the resulting connection ends
    dialing: Arc<AtomicBool>,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(peer: Peer, connect_timeout: Duration) -> Self {
        Self {
            peer,
            dialing: Arc::new(AtomicBool::new(false)),
            connect_timeout,
        }
    }
}

impl PeerSocket for Dialer {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn start(&self, addr: IpAddr, port: u16) {
        if self.peer.is_connected() || self.dialing.swap(true, Ordering::SeqCst) {
            return;
        }

        let peer = self.peer.clone();
        let dialing = self.dialing.clone();
        let target = SocketAddr::new(addr, port);
        let connect_timeout = self.connect_timeout;

        tokio::spawn(async move {
            tracing::info!("Connecting to {}", target);

            match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => peer.run_session(stream, target).await,
                Ok(Err(e)) => tracing::info!("Could not connect to {}: {}", target, e),
                Err(_) => tracing::info!("Connection to {} timed out", target),
            }

            dialing.store(false, Ordering::SeqCst);
        });
    }

    fn is_connecting(&self) -> bool {
        self.dialing.load(Ordering::SeqCst) && !self.peer.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_double_start_makes_one_attempt() {
        let raw = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = raw.local_addr().unwrap().port();

        let dialer = Dialer::new(Peer::new("guest"), Duration::from_millis(500));
        dialer.start(LOCALHOST, port);
        dialer.start(LOCALHOST, port);

        let (_first, _) = tokio::time::timeout(Duration::from_secs(2), raw.accept())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_millis(300), raw.accept()).await;
        assert!(second.is_err(), "a second connection attempt was made");
    }

    #[tokio::test]
    async fn test_refused_attempt_returns_to_idle() {
        // Grab a free port, then release it so nothing listens there.
        let port = {
            let probe = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
            probe.local_addr().unwrap().port()
        };

        let dialer = Dialer::new(Peer::new("guest"), Duration::from_millis(200));
        dialer.start(LOCALHOST, port);
        assert!(dialer.is_connecting());

        tokio::time::timeout(Duration::from_secs(2), async {
            while dialer.is_connecting() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!dialer.is_connected());
        assert_eq!(dialer.peer_name(), None);
    }
}
