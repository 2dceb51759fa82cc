//! Listening side of a pairing
//!
//! Accepts one connection at a time: the accept loop serves a connection until it
//! drops, then goes back to accepting. It never ends on its own; dropping the
//! [`Listener`] stops it and releases the port.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::AbortHandle;

use super::{Peer, PeerSocket};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
    peer: Peer,
    started: Arc<AtomicBool>,
    /// Address actually bound, once the background bind succeeded
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    accept_task: Mutex<Option<AbortHandle>>,
}

impl Listener {
    pub fn new(peer: Peer) -> Self {
        Self {
            peer,
            started: Arc::new(AtomicBool::new(false)),
            local_addr: Arc::new(Mutex::new(None)),
            accept_task: Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_listening(&self) -> bool {
        self.local_addr().is_some()
    }
}

impl PeerSocket for Listener {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn start(&self, addr: IpAddr, port: u16) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let peer = self.peer.clone();
        let started = self.started.clone();
        let local_addr = self.local_addr.clone();
        let bind_addr = SocketAddr::new(addr, port);

        let task = tokio::spawn(async move {
            let listener = match TcpListener::bind(bind_addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!("Failed to bind {}: {}", bind_addr, e);
                    started.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let bound = listener.local_addr().unwrap_or(bind_addr);
            *local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(bound);
            tracing::info!("Listening on {} as '{}'", bound, peer.local_name());

            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        tracing::info!("New connection from {}", remote);
                        peer.run_session(stream, remote).await;
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        });

        *self.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());
    }

    /// Listeners go straight from idle to connected
    fn is_connecting(&self) -> bool {
        false
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let task = self
            .accept_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Dialer;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn listening(name: &str) -> (Listener, u16) {
        let listener = Listener::new(Peer::new(name));
        listener.start(LOCALHOST, 0);
        wait_until(|| listener.is_listening()).await;
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_listener_accepts_again_after_disconnect() {
        let (listener, port) = listening("host").await;

        let first = Dialer::new(Peer::new("guest-1"), Duration::from_millis(500));
        first.start(LOCALHOST, port);
        wait_until(|| {
            listener.peer_name().as_deref() == Some("guest-1")
                && first.peer_name().as_deref() == Some("host")
        })
        .await;

        first.kill();
        wait_until(|| listener.peer_name().is_none()).await;

        let second = Dialer::new(Peer::new("guest-2"), Duration::from_millis(500));
        second.start(LOCALHOST, port);
        wait_until(|| {
            listener.peer_name().as_deref() == Some("guest-2")
                && second.peer_name().as_deref() == Some("host")
        })
        .await;
    }

    #[tokio::test]
    async fn test_drop_releases_port() {
        let (listener, port) = listening("host").await;
        drop(listener);

        // The port becomes bindable again once the accept loop is gone.
        let replacement = Listener::new(Peer::new("host-again"));
        wait_until(|| {
            replacement.start(LOCALHOST, port);
            replacement.is_listening()
        })
        .await;
        assert_eq!(replacement.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (listener, port) = listening("host").await;
        listener.start(LOCALHOST, port.wrapping_add(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }
}
