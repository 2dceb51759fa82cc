//! Peer socket core
//!
//! One [`Peer`] owns at most one live connection at a time and multiplexes it:
//! inbound envelopes whose tag has an enrolled handler are answered by that handler,
//! everything else is parked in a one-slot-per-tag table until a [`Peer::request`]
//! call claims it. Both connection roles ([`super::Listener`], [`super::Dialer`]) hand
//! their established streams to [`Peer::run_session`].

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use crate::protocol::{Message, Tag};

/// Peer socket errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Peer disconnected")]
    Disconnected,

    #[error("No response with tag {0} before the deadline")]
    Timeout(Tag),

    #[error("Tag {0} is reserved for the handshake")]
    ReservedTag(Tag),
}

pub type PeerResult<T> = Result<T, PeerError>;

/// Future returned by an enrolled handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Message> + Send>>;

type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;
type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Capacity of the outbound queue in front of each connection
const OUTBOUND_CAPACITY: usize = 256;

/// Everything guarded by the peer's single lock
#[derive(Default)]
struct PeerState {
    connection: Option<ConnectionHandle>,
    /// Set by the handshake, cleared with the connection
    peer_name: Option<String>,
    handlers: HashMap<Tag, Handler>,
    /// Latest unclaimed envelope per tag
    pending: HashMap<Tag, Message>,
    on_disconnected: Option<DisconnectHook>,
}

struct Inner {
    local_name: String,
    state: Mutex<PeerState>,
    /// Woken whenever `pending` gains an entry or the connection goes away
    arrivals: Notify,
    next_connection_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to a peer socket; clones refer to the same socket
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

/// Non-owning handle, for handlers that need to look at their own peer
#[derive(Clone)]
pub struct WeakPeer {
    inner: Weak<Inner>,
}

impl WeakPeer {
    pub fn upgrade(&self) -> Option<Peer> {
        self.inner.upgrade().map(|inner| Peer { inner })
    }
}

impl Peer {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                local_name: local_name.into(),
                state: Mutex::new(PeerState::default()),
                arrivals: Notify::new(),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakPeer {
        WeakPeer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Name this side introduces itself with
    pub fn local_name(&self) -> &str {
        &self.inner.local_name
    }

    /// Name learned from the other side's handshake, if connected
    pub fn peer_name(&self) -> Option<String> {
        self.inner.lock().peer_name.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connection.is_some()
    }

    /// Remote address of the live connection
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner
            .lock()
            .connection
            .as_ref()
            .map(ConnectionHandle::remote_addr)
    }

    /// Register the handler answering envelopes tagged `tag`.
    ///
    /// Replaces any previous handler for the tag. Each inbound envelope runs its
    /// handler on a task of its own and the returned envelope is sent back as is.
    pub fn enroll<F, Fut>(&self, tag: impl Into<Tag>, handler: F) -> PeerResult<()>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Message> + Send + 'static,
    {
        let tag = tag.into();
        if tag.is_reserved() {
            return Err(PeerError::ReservedTag(tag));
        }

        let boxed: Handler = Arc::new(move |message| -> HandlerFuture { Box::pin(handler(message)) });
        self.inner.lock().handlers.insert(tag, boxed);
        Ok(())
    }

    /// Hook run after every connection loss, whoever caused it
    pub fn on_disconnected<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.lock().on_disconnected = Some(Arc::new(hook));
    }

    /// Send `message` and wait for the next envelope tagged `expected`.
    ///
    /// Responses are matched by tag only: two outstanding requests waiting on the same
    /// tag race for whichever response arrives. Waits forever if the peer never answers
    /// and the connection stays up; see [`Peer::request_timeout`].
    pub async fn request(&self, message: Message, expected: impl Into<Tag>) -> PeerResult<Message> {
        let expected = expected.into();
        let handle = self
            .inner
            .lock()
            .connection
            .clone()
            .ok_or(PeerError::Disconnected)?;

        tracing::debug!("Request {} awaiting {}", message.tag, expected);
        handle
            .send(message)
            .await
            .map_err(|_| PeerError::Disconnected)?;

        self.await_response(expected, handle.id()).await
    }

    /// [`Peer::request`] bounded by a deadline
    pub async fn request_timeout(
        &self,
        message: Message,
        expected: impl Into<Tag>,
        timeout: Duration,
    ) -> PeerResult<Message> {
        let expected = expected.into();
        tokio::time::timeout(timeout, self.request(message, expected))
            .await
            .map_err(|_| PeerError::Timeout(expected))?
    }

    /// Close the live connection, if any. Cleanup runs exactly as for a remote close.
    pub fn kill(&self) {
        if let Some(handle) = self.inner.lock().connection.as_ref() {
            tracing::info!("Closing connection to {}", handle.remote_addr());
            handle.close();
        }
    }

    async fn await_response(&self, expected: Tag, connection_id: u64) -> PeerResult<Message> {
        loop {
            let notified = self.inner.arrivals.notified();
            tokio::pin!(notified);
            // Register interest before checking so an arrival in between is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if let Some(message) = state.pending.remove(&expected) {
                    return Ok(message);
                }
                if state.connection.as_ref().map(ConnectionHandle::id) != Some(connection_id) {
                    return Err(PeerError::Disconnected);
                }
            }

            notified.await;
        }
    }

    /// Serve one established stream until it closes.
    ///
    /// Installs the stream as the live connection (closing any previous one), performs
    /// the handshake and runs the receive loop. Returns after cleanup has run.
    pub(crate) async fn run_session(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let mut conn = Connection::new(stream, remote_addr);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle::new(id, remote_addr, outbound_tx.clone(), shutdown_tx);

        {
            let mut state = self.inner.lock();
            if let Some(previous) = state.connection.replace(handle) {
                tracing::warn!("Replacing live connection to {}", previous.remote_addr());
                previous.close();
            }
            state.peer_name = None;
            state.pending.clear();
        }
        // Waiters on the replaced connection must notice it is gone.
        self.inner.arrivals.notify_waiters();

        let guard = SessionGuard { peer: self, id };
        tracing::info!("Connected to {}", remote_addr);

        let reason = match conn.send(&Message::introduce(self.local_name())).await {
            Err(e) => format!("Handshake error: {}", e),
            Ok(()) => loop {
                tokio::select! {
                    result = conn.recv() => {
                        match result {
                            Ok(Some(frame)) => {
                                if let Err(e) = self.dispatch(&mut conn, id, frame.message, &outbound_tx).await {
                                    break format!("Error: {}", e);
                                }
                            }
                            Ok(None) => break "Connection closed".to_string(),
                            Err(e) => break format!("Error: {}", e),
                        }
                    }

                    Some(message) = outbound_rx.recv() => {
                        tracing::debug!("Sending {} to {}", message.tag, remote_addr);
                        if let Err(e) = conn.send(&message).await {
                            break format!("Send error: {}", e);
                        }
                    }

                    _ = shutdown_rx.recv() => break "Closed locally".to_string(),
                }
            },
        };

        let stats = conn.stats().clone();
        let _ = conn.close().await;
        tracing::info!(
            "Disconnected from {}: {} (sent {} msgs / {} bytes, received {} msgs / {} bytes)",
            remote_addr,
            reason,
            stats.messages_sent,
            stats.bytes_sent,
            stats.messages_received,
            stats.bytes_received
        );
        drop(guard);
    }

    /// Route one inbound envelope
    async fn dispatch(
        &self,
        conn: &mut Connection,
        connection_id: u64,
        message: Message,
        outbound: &mpsc::Sender<Message>,
    ) -> Result<(), ConnectionError> {
        tracing::debug!("Received {} from {}", message.tag, conn.remote_addr());

        if message.tag.is_reserved() {
            let name: String = message.body_as().map_err(|e| {
                ConnectionError::Protocol(crate::protocol::CodecError::Serialization(e))
            })?;
            let is_introduce = message.tag == Tag::INTRODUCE;

            {
                let mut state = self.inner.lock();
                if state.connection.as_ref().map(ConnectionHandle::id) == Some(connection_id)
                    && (is_introduce || state.peer_name.is_none())
                {
                    state.peer_name = Some(name.clone());
                }
            }

            if is_introduce {
                tracing::info!("Handshake complete with {} ({})", name, conn.remote_addr());
                conn.send(&Message::introduce_reply(self.local_name())).await?;
            }
            return Ok(());
        }

        let handler = {
            let mut state = self.inner.lock();
            match state.handlers.get(&message.tag) {
                Some(handler) => Some(handler.clone()),
                None => {
                    state.pending.insert(message.tag, message.clone());
                    None
                }
            }
        };

        match handler {
            Some(handler) => {
                let outbound = outbound.clone();
                let tag = message.tag;
                tokio::spawn(async move {
                    let reply = handler(message).await;
                    if outbound.send(reply).await.is_err() {
                        tracing::debug!("Dropped reply to {}: connection gone", tag);
                    }
                });
            }
            None => self.inner.arrivals.notify_waiters(),
        }

        Ok(())
    }
}

/// Funnels every way a session can end (error, remote close, kill, task abort)
/// into the same cleanup.
struct SessionGuard<'a> {
    peer: &'a Peer,
    id: u64,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let hook = {
            let mut state = self.peer.inner.lock();
            if state.connection.as_ref().map(ConnectionHandle::id) == Some(self.id) {
                state.connection = None;
                state.peer_name = None;
            }
            state.on_disconnected.clone()
        };
        self.peer.inner.arrivals.notify_waiters();

        if let Some(hook) = hook {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    /// Two peers wired over loopback, each serving its end of the stream
    async fn connected_pair() -> (Peer, Peer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let dialed = dialed.unwrap();
        let (accepted, accepted_from) = accepted.unwrap();

        let server = Peer::new("server");
        let client = Peer::new("client");
        let s = server.clone();
        tokio::spawn(async move { s.run_session(accepted, accepted_from).await });
        let c = client.clone();
        tokio::spawn(async move { c.run_session(dialed, addr).await });

        wait_until(|| server.peer_name().is_some() && client.peer_name().is_some()).await;
        (server, client)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_handshake_exchanges_names() {
        let (server, client) = connected_pair().await;
        assert_eq!(server.peer_name().as_deref(), Some("client"));
        assert_eq!(client.peer_name().as_deref(), Some("server"));
        assert!(server.is_connected() && client.is_connected());
    }

    #[tokio::test]
    async fn test_request_hits_handler() {
        let (server, client) = connected_pair().await;
        server
            .enroll(MessageKind::Chat, |message| async move {
                let text: String = message.body_as().unwrap_or_default();
                Message::new(MessageKind::ChatReply, json!(text.to_uppercase()))
            })
            .unwrap();

        let reply = client
            .request(Message::new(MessageKind::Chat, json!("hello")), MessageKind::ChatReply)
            .await
            .unwrap();
        assert_eq!(reply.body, json!("HELLO"));
    }

    #[tokio::test]
    async fn test_reserved_tags_rejected() {
        let peer = Peer::new("solo");
        let result = peer.enroll(Tag::INTRODUCE, |m| async move { m });
        assert_eq!(result, Err(PeerError::ReservedTag(Tag::INTRODUCE)));
    }

    #[tokio::test]
    async fn test_concurrent_requests_matched_by_tag() {
        let (server, client) = connected_pair().await;
        server
            .enroll(MessageKind::ScoreRequest, |_| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Message::new(MessageKind::Score, json!(1200))
            })
            .unwrap();
        server
            .enroll(MessageKind::QueueRequest, |_| async move {
                Message::new(MessageKind::Queue, json!([[1, 1], [1, 1]]))
            })
            .unwrap();

        let (score, queue) = tokio::join!(
            client.request(Message::empty(MessageKind::ScoreRequest), MessageKind::Score),
            client.request(Message::empty(MessageKind::QueueRequest), MessageKind::Queue),
        );
        assert_eq!(score.unwrap().body, json!(1200));
        assert_eq!(queue.unwrap().body, json!([[1, 1], [1, 1]]));
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_stall_others() {
        let (server, client) = connected_pair().await;
        server
            .enroll(MessageKind::ScoreRequest, |_| async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Message::new(MessageKind::Score, json!(0))
            })
            .unwrap();
        server
            .enroll(MessageKind::QueueRequest, |_| async move {
                Message::new(MessageKind::Queue, json!([]))
            })
            .unwrap();

        let slow_client = client.clone();
        let slow = tokio::spawn(async move {
            slow_client
                .request(Message::empty(MessageKind::ScoreRequest), MessageKind::Score)
                .await
        });
        // Let the slow request reach the server first.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = tokio::time::Instant::now();
        let queue = client
            .request_timeout(
                Message::empty(MessageKind::QueueRequest),
                MessageKind::Queue,
                Duration::from_millis(500),
            )
            .await
            .unwrap();
        assert_eq!(queue.body, json!([]));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!slow.is_finished());
        slow.abort();
    }

    #[tokio::test]
    async fn test_latest_unclaimed_response_wins() {
        let (server, client) = connected_pair().await;

        // Two Score envelopes arrive while nobody on the client is waiting for one.
        let server_handle = server.inner.lock().connection.clone().unwrap();
        server_handle.send(Message::new(MessageKind::Score, json!("first"))).await.unwrap();
        server_handle.send(Message::new(MessageKind::Score, json!("second"))).await.unwrap();
        wait_until(|| {
            client.inner.lock().pending.get(&MessageKind::Score.tag()).map(|m| m.body.clone())
                == Some(json!("second"))
        })
        .await;

        // The server has no Chat handler, so the only Score the client can get is the parked one.
        let parked = client
            .request(Message::empty(MessageKind::Chat), MessageKind::Score)
            .await
            .unwrap();
        assert_eq!(parked.body, json!("second"));
        assert!(client.inner.lock().pending.get(&MessageKind::Score.tag()).is_none());
    }

    #[tokio::test]
    async fn test_kill_propagates_disconnect() {
        let (server, client) = connected_pair().await;
        let hook_calls = Arc::new(AtomicUsize::new(0));
        let calls = hook_calls.clone();
        client.on_disconnected(move || {
            calls.fetch_add(1, Ordering::SeqCst);
        });

        // The server never answers Map, so this request can only end by disconnection.
        let waiting = {
            let client = client.clone();
            tokio::spawn(async move {
                client.request(Message::empty(MessageKind::MapRequest), MessageKind::Map).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.kill();

        let result = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(PeerError::Disconnected));
        wait_until(|| client.peer_name().is_none() && server.peer_name().is_none()).await;
        assert!(!client.is_connected());
        assert!(!server.is_connected());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_request_without_connection() {
        let peer = Peer::new("solo");
        let result = peer.request(Message::empty(MessageKind::Ready), MessageKind::ReadyReply).await;
        assert_eq!(result, Err(PeerError::Disconnected));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (_server, client) = connected_pair().await;
        let result = client
            .request_timeout(
                Message::empty(MessageKind::MapRequest),
                MessageKind::Map,
                Duration::from_millis(100),
            )
            .await;
        assert_eq!(result, Err(PeerError::Timeout(MessageKind::Map.tag())));
        assert!(client.is_connected());
    }
}
