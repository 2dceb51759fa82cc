//! Two-player cooperative falling-block game
//!
//! Every named player steers their own piece on one shared board. The score is shared
//! and speeds up gravity for everyone.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

use super::board::{Board, Step};
use super::piece::{Form, Point};
use super::{Control, Phase, Snapshot};

/// Points per cleared row
const ROW_SCORE: u64 = 100;

/// Gravity interval for a given score: one second at zero, halved at 1000 points
pub fn fall_interval(score: u64) -> Duration {
    Duration::from_nanos(1_000_000_000 * 1000 / (1000 + score))
}

pub struct Tetris {
    /// Player names in slot order. Names are display only and may repeat.
    players: Vec<String>,
    board: Board,
    score: u64,
    fall_interval: Duration,
    phase: Phase,
}

impl Tetris {
    pub fn new(players: Vec<String>, queue_preview: usize) -> Self {
        Self::with_rng(players, queue_preview, StdRng::from_rng(&mut rand::rng()))
    }

    /// Deterministic game for a given random source
    pub fn with_rng(players: Vec<String>, queue_preview: usize, rng: StdRng) -> Self {
        let board = Board::new(players.len(), queue_preview, rng, Instant::now());
        Self {
            players,
            board,
            score: 0,
            fall_interval: fall_interval(0),
            phase: Phase::Waiting,
        }
    }

    pub fn start(&mut self) {
        if self.phase == Phase::Waiting {
            tracing::info!("Game started for {}", self.players.join(" and "));
            self.phase = Phase::Playing;
        }
    }

    pub fn end(&mut self) {
        if self.phase != Phase::Ended {
            tracing::info!("Game over with score {}", self.score);
            self.phase = Phase::Ended;
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn score(&self) -> u64 {
        self.score
    }

    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    /// Advance gravity to `now`
    pub fn update_at(&mut self, now: Instant) {
        if self.phase != Phase::Playing {
            return;
        }

        for slot in 0..self.players.len() {
            let due = self
                .board
                .hang_time(slot, now)
                .is_some_and(|hang| hang >= self.fall_interval);
            if !due {
                continue;
            }
            if let Err(collision) = self.board.step(slot, Step::Down, now) {
                if collision.lands() && !self.settle(slot, now) {
                    return;
                }
            }
        }

        self.fall_interval = fall_interval(self.score);
    }

    /// Apply one control to the piece in `slot`. Ignored outside play or for unknown slots.
    pub fn control(&mut self, slot: usize, control: Control) {
        if self.phase != Phase::Playing {
            return;
        }
        if slot >= self.players.len() {
            tracing::debug!("Control for unknown slot {}", slot);
            return;
        }

        let now = Instant::now();
        match control {
            Control::MoveLeft => {
                let _ = self.board.step(slot, Step::Left, now);
            }
            Control::MoveRight => {
                let _ = self.board.step(slot, Step::Right, now);
            }
            Control::MoveDown => {
                let _ = self.board.step(slot, Step::Down, now);
            }
            Control::Rotate => {
                self.board.rotate(slot, true);
            }
            Control::HardDrop => {
                if self.board.hard_drop(slot, now).is_some_and(|c| c.lands()) {
                    self.settle(slot, now);
                }
            }
        }
    }

    pub fn map(&self) -> Vec<Vec<u8>> {
        self.board.map()
    }

    pub fn queue(&self) -> Vec<Form> {
        self.board.queue()
    }

    /// Cells of the falling piece in `slot`; empty for unknown slots
    pub fn position(&self, slot: usize) -> Vec<Point> {
        if slot < self.players.len() {
            self.board.position(slot)
        } else {
            Vec::new()
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            map: self.map(),
            score: self.score,
            queue: self.queue(),
            players: self.players.clone(),
            positions: (0..self.players.len()).map(|slot| self.position(slot)).collect(),
            phase: self.phase,
        }
    }

    /// Settle the slot's piece; ends the game and returns false when no next piece fits
    fn settle(&mut self, slot: usize, now: Instant) -> bool {
        match self.board.settle(slot, now) {
            Some(rows) => {
                if rows > 0 {
                    tracing::debug!("{} cleared {} row(s)", self.players[slot], rows);
                }
                self.score += ROW_SCORE * u64::from(rows);
                true
            }
            None => {
                self.end();
                false
            }
        }
    }
}
