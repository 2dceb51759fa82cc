//! Pre-game lobby
//!
//! Listens for a partner by default, switches to dialing when the player picks an
//! address and falls back to listening when that dial fails or its connection drops.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{call, reply, Match, Role, SessionConfig, SessionError, SessionResult};
use crate::discovery::{local_addresses, DiscoveredPeer, Scanner};
use crate::network::Peer;
use crate::protocol::{Message, MessageKind};

/// One line of lobby chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub from: String,
    pub text: String,
    /// Typed here rather than received
    pub own: bool,
}

#[derive(Default)]
struct LobbyState {
    chat: VecDeque<ChatLine>,
    ready: bool,
    peer_ready: bool,
}

/// State touched by the peer's handlers
struct Shared {
    state: Mutex<LobbyState>,
    chat_capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LobbyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_chat(&self, from: String, text: String, own: bool) {
        let mut state = self.lock();
        state.chat.push_back(ChatLine { from, text, own });
        while state.chat.len() > self.chat_capacity {
            state.chat.pop_front();
        }
    }

    fn reset_ready(&self) {
        let mut state = self.lock();
        state.ready = false;
        state.peer_ready = false;
    }
}

pub struct Lobby {
    name: String,
    config: SessionConfig,
    role: Role,
    scanner: Scanner,
    shared: Arc<Shared>,
}

impl Lobby {
    pub fn new(name: impl Into<String>, config: SessionConfig) -> Self {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(LobbyState::default()),
            chat_capacity: config.chat_capacity,
        });
        let scanner = Scanner::new(name.clone(), config.scan.clone());
        let role = Role::listen(Peer::new(name.clone()));
        install_handlers(&role, &shared);

        Self {
            name,
            config,
            role,
            scanner,
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Start listening for a partner
    pub fn start(&self) {
        self.role
            .start(self.config.network.bind_address, self.config.network.port);
    }

    /// Sweep the LAN on our port. Our own listener is left out of the sweep.
    pub fn scan(&self) {
        let port = self.config.network.port;
        let listening_here = self
            .role
            .local_addr()
            .is_some_and(|addr| addr.port() == port);
        let skip = if listening_here {
            local_addresses()
        } else {
            Vec::new()
        };
        self.scanner.scan_excluding(port, skip);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Peers found by the last scan; `None` while scanning
    pub fn servers(&self) -> Option<Vec<DiscoveredPeer>> {
        self.scanner.results()
    }

    /// Dial `target`, giving up the listening socket
    pub fn connect(&mut self, target: SocketAddr) {
        if self.role.is_listener() {
            tracing::info!("Switching to dialing {}", target);
            self.replace_role(Role::dial(Peer::new(self.name.clone()), &self.config.network));
        }
        self.role.start(target.ip(), target.port());
    }

    pub fn is_connecting(&self) -> bool {
        self.role.socket().is_connecting()
    }

    pub fn is_connected(&self) -> bool {
        self.role.socket().is_connected()
    }

    pub fn peer_name(&self) -> Option<String> {
        self.role.socket().peer_name()
    }

    /// Whether a partner is paired. Falls back to listening when a dial has failed or
    /// the dialed connection is gone.
    pub fn check_connection(&mut self) -> bool {
        if self.peer_name().is_some() {
            return true;
        }
        if !self.role.is_listener() && !self.is_connecting() && !self.is_connected() {
            tracing::info!("No partner reached, listening again");
            self.replace_role(Role::listen(Peer::new(self.name.clone())));
            self.start();
        }
        false
    }

    pub fn chat_log(&self) -> Vec<ChatLine> {
        self.shared.lock().chat.iter().cloned().collect()
    }

    /// Log `text` locally and deliver it to the partner, if there is one
    pub async fn send_chat(&self, text: &str) -> SessionResult<()> {
        self.shared.add_chat(self.name.clone(), text.to_string(), true);
        if self.peer_name().is_none() {
            return Ok(());
        }

        let message = Message::with_body(MessageKind::Chat, &text)?;
        call(self.role.peer(), message, self.config.network.request_timeout()).await?;
        Ok(())
    }

    /// Flip readiness (or force it) and tell the partner about a change
    pub async fn toggle_ready(&self, force: Option<bool>) -> SessionResult<bool> {
        if self.peer_name().is_none() {
            return Err(SessionError::NotPaired);
        }

        let (before, now) = {
            let mut state = self.shared.lock();
            let before = state.ready;
            state.ready = force.unwrap_or(!before);
            (before, state.ready)
        };

        let request = match (before, now) {
            (false, true) => MessageKind::Ready,
            (true, false) => MessageKind::Busy,
            _ => return Ok(now),
        };
        call(
            self.role.peer(),
            Message::empty(request),
            self.config.network.request_timeout(),
        )
        .await?;
        Ok(now)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lock().ready
    }

    pub fn both_ready(&self) -> bool {
        let state = self.shared.lock();
        state.ready && state.peer_ready
    }

    /// Hand the paired connection over to a match. The listening side hosts.
    pub fn into_match(self) -> SessionResult<Match> {
        if self.peer_name().is_none() {
            return Err(SessionError::NotPaired);
        }
        let deadline = self.config.network.request_timeout();
        if self.role.is_listener() {
            Match::host(self.role, self.config.queue_preview, deadline)
        } else {
            Match::guest(self.role, deadline)
        }
    }

    fn replace_role(&mut self, role: Role) {
        install_handlers(&role, &self.shared);
        self.shared.reset_ready();
        self.role = role;
    }
}

fn install_handlers(role: &Role, shared: &Arc<Shared>) {
    let peer = role.peer();

    let chat_shared = shared.clone();
    let weak = peer.downgrade();
    let _ = peer.enroll(MessageKind::Chat, move |message: Message| {
        let from = weak
            .upgrade()
            .and_then(|peer| peer.peer_name())
            .unwrap_or_else(|| "?".to_string());
        match message.body_as::<String>() {
            Ok(text) => chat_shared.add_chat(from, text, false),
            Err(e) => tracing::warn!("Unreadable chat from {}: {}", from, e),
        }
        std::future::ready(Message::empty(MessageKind::ChatReply))
    });

    let ready_shared = shared.clone();
    let _ = peer.enroll(MessageKind::Ready, move |_| {
        ready_shared.lock().peer_ready = true;
        std::future::ready(Message::empty(MessageKind::ReadyReply))
    });

    let busy_shared = shared.clone();
    let _ = peer.enroll(MessageKind::Busy, move |_| {
        busy_shared.lock().peer_ready = false;
        std::future::ready(Message::empty(MessageKind::BusyReply))
    });

    // Still in the lobby, so not in game mode yet. A guest match replaces this.
    if !role.is_listener() {
        let _ = peer.enroll(MessageKind::ModeCheck, |_| {
            std::future::ready(reply(MessageKind::ModeCheckReply, &false))
        });
    }

    let hook_shared = shared.clone();
    peer.on_disconnected(move || hook_shared.reset_ready());
}
