//! Networked match
//!
//! The host runs the only [`Tetris`] and answers state queries and controls; the guest
//! keeps a mirror refreshed from host snapshots and forwards its controls.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{call, reply, Role, SessionError, SessionResult};
use crate::game::{Control, Phase, Snapshot, Tetris};
use crate::network::Peer;
use crate::protocol::{Message, MessageKind};

/// Pause between asking the guest whether it is ready to play
const MODE_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Board slot of the hosting player
pub const HOST_SLOT: usize = 0;
/// Board slot of the guest
pub const GUEST_SLOT: usize = 1;

/// One side of a running match
pub enum Match {
    Host(Host),
    Guest(Guest),
}

impl Match {
    pub fn host(role: Role, queue_preview: usize, deadline: Option<Duration>) -> SessionResult<Self> {
        Ok(Match::Host(Host::new(role, queue_preview, deadline)?))
    }

    pub fn guest(role: Role, deadline: Option<Duration>) -> SessionResult<Self> {
        Ok(Match::Guest(Guest::new(role, deadline)?))
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Match::Host(_))
    }

    pub fn local_name(&self) -> &str {
        self.role().peer().local_name()
    }

    pub fn opponent(&self) -> &str {
        match self {
            Match::Host(host) => &host.opponent,
            Match::Guest(guest) => &guest.opponent,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.role().socket().is_connected()
    }

    pub async fn start(&mut self) -> SessionResult<()> {
        match self {
            Match::Host(host) => host.start().await,
            Match::Guest(guest) => guest.update().await,
        }
    }

    /// Advance one frame: gravity on the host, a snapshot refresh on the guest
    pub async fn update(&mut self) -> SessionResult<()> {
        match self {
            Match::Host(host) => host.update().await,
            Match::Guest(guest) => guest.update().await,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Match::Host(host) => host.lock().phase(),
            Match::Guest(guest) => guest.phase(),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        match self {
            Match::Host(host) => host.lock().snapshot(),
            Match::Guest(guest) => guest.snapshot(),
        }
    }

    /// Steer the local player's piece
    pub async fn control(&self, control: Control) -> SessionResult<()> {
        match self {
            Match::Host(host) => {
                host.lock().control(HOST_SLOT, control);
                Ok(())
            }
            Match::Guest(guest) => guest.control(control).await,
        }
    }

    fn role(&self) -> &Role {
        match self {
            Match::Host(host) => &host.role,
            Match::Guest(guest) => &guest.role,
        }
    }
}

pub struct Host {
    role: Role,
    opponent: String,
    game: Arc<Mutex<Tetris>>,
    deadline: Option<Duration>,
    ended_announced: bool,
}

impl Host {
    fn new(role: Role, queue_preview: usize, deadline: Option<Duration>) -> SessionResult<Self> {
        let peer = role.peer().clone();
        let opponent = peer.peer_name().ok_or(SessionError::NotPaired)?;
        let players = vec![peer.local_name().to_string(), opponent.clone()];
        let game = Arc::new(Mutex::new(Tetris::new(players, queue_preview)));

        serve_state(&peer, &game);

        let control_game = game.clone();
        let _ = peer.enroll(MessageKind::Control, move |message: Message| {
            match message.body_as::<Control>() {
                Ok(control) => lock(&control_game).control(GUEST_SLOT, control),
                Err(e) => tracing::warn!("Ignoring unreadable guest control: {}", e),
            }
            std::future::ready(Message::empty(MessageKind::ControlReply))
        });

        Ok(Self {
            role,
            opponent,
            game,
            deadline,
            ended_announced: false,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tetris> {
        lock(&self.game)
    }

    /// Start the game once the guest has switched into game mode
    async fn start(&mut self) -> SessionResult<()> {
        self.lock().start();
        let peer = self.role.peer();

        loop {
            let answer = call(peer, Message::empty(MessageKind::ModeCheck), self.deadline).await?;
            if answer.body_as::<bool>()? {
                break;
            }
            tokio::time::sleep(MODE_CHECK_INTERVAL).await;
        }

        call(peer, Message::empty(MessageKind::Start), self.deadline).await?;
        Ok(())
    }

    /// Run gravity; the first frame after the game ends sends the guest the final board
    async fn update(&mut self) -> SessionResult<()> {
        let ended = {
            let mut game = self.lock();
            game.update();
            (game.phase() == Phase::Ended).then(|| game.snapshot())
        };

        if let Some(last) = ended {
            if !self.ended_announced {
                self.ended_announced = true;
                let message = Message::with_body(MessageKind::Ended, &last)?;
                call(self.role.peer(), message, self.deadline).await?;
            }
        }
        Ok(())
    }
}

fn lock(game: &Mutex<Tetris>) -> MutexGuard<'_, Tetris> {
    game.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Answer the guest's state queries from the shared game
fn serve_state(peer: &Peer, game: &Arc<Mutex<Tetris>>) {
    let map_game = game.clone();
    let _ = peer.enroll(MessageKind::MapRequest, move |_| {
        std::future::ready(reply(MessageKind::Map, &lock(&map_game).map()))
    });

    let score_game = game.clone();
    let _ = peer.enroll(MessageKind::ScoreRequest, move |_| {
        std::future::ready(reply(MessageKind::Score, &lock(&score_game).score()))
    });

    let queue_game = game.clone();
    let _ = peer.enroll(MessageKind::QueueRequest, move |_| {
        std::future::ready(reply(MessageKind::Queue, &lock(&queue_game).queue()))
    });

    // Asked by slot; unknown slots get no cells.
    let position_game = game.clone();
    let _ = peer.enroll(MessageKind::PositionRequest, move |message: Message| {
        let slot = message.body_as::<usize>().unwrap_or(usize::MAX);
        let cells = lock(&position_game).position(slot);
        std::future::ready(reply(MessageKind::Position, &(slot, cells)))
    });

    let snapshot_game = game.clone();
    let _ = peer.enroll(MessageKind::SnapshotRequest, move |_| {
        std::future::ready(reply(MessageKind::Snapshot, &lock(&snapshot_game).snapshot()))
    });
}

#[derive(Default)]
struct GuestFlags {
    started: bool,
    /// Final board sent along with the end of the game
    ended: Option<Snapshot>,
}

pub struct Guest {
    role: Role,
    opponent: String,
    flags: Arc<Mutex<GuestFlags>>,
    snapshot: Snapshot,
    deadline: Option<Duration>,
}

impl Guest {
    fn new(role: Role, deadline: Option<Duration>) -> SessionResult<Self> {
        let peer = role.peer();
        let opponent = peer.peer_name().ok_or(SessionError::NotPaired)?;
        let flags = Arc::new(Mutex::new(GuestFlags::default()));

        let start_flags = flags.clone();
        let _ = peer.enroll(MessageKind::Start, move |_| {
            flags_lock(&start_flags).started = true;
            std::future::ready(Message::empty(MessageKind::StartReply))
        });

        let end_flags = flags.clone();
        let _ = peer.enroll(MessageKind::Ended, move |message: Message| {
            let last = message.body_as::<Snapshot>().unwrap_or_else(|e| {
                tracing::warn!("Unreadable final board: {}", e);
                Snapshot {
                    phase: Phase::Ended,
                    ..Default::default()
                }
            });
            flags_lock(&end_flags).ended = Some(last);
            std::future::ready(Message::empty(MessageKind::EndedReply))
        });

        let _ = peer.enroll(MessageKind::ModeCheck, |_| {
            std::future::ready(reply(MessageKind::ModeCheckReply, &true))
        });

        Ok(Self {
            role,
            opponent,
            flags,
            snapshot: Snapshot::default(),
            deadline,
        })
    }

    fn phase(&self) -> Phase {
        let flags = flags_lock(&self.flags);
        match (flags.started, flags.ended.is_some()) {
            (false, _) => Phase::Waiting,
            (true, false) => Phase::Playing,
            (true, true) => Phase::Ended,
        }
    }

    /// Latest mirror, or the final board once the host has ended the game
    fn snapshot(&self) -> Snapshot {
        match &flags_lock(&self.flags).ended {
            Some(last) => last.clone(),
            None => self.snapshot.clone(),
        }
    }

    async fn update(&mut self) -> SessionResult<()> {
        if flags_lock(&self.flags).ended.is_some() {
            return Ok(());
        }
        let response = self.ask(Message::empty(MessageKind::SnapshotRequest)).await?;
        self.snapshot = response.body_as()?;
        Ok(())
    }

    async fn control(&self, control: Control) -> SessionResult<()> {
        let message = Message::with_body(MessageKind::Control, &control)?;
        self.ask(message).await?;
        Ok(())
    }

    async fn ask(&self, message: Message) -> SessionResult<Message> {
        call(self.role.peer(), message, self.deadline).await
    }
}

fn flags_lock(flags: &Mutex<GuestFlags>) -> MutexGuard<'_, GuestFlags> {
    flags.lock().unwrap_or_else(PoisonError::into_inner)
}
