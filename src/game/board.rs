//! Shared playfield
//!
//! One grid of settled cells, one falling piece per player slot and one piece queue
//! that all players draw from.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::piece::{Form, Piece, Point, PIECE_KINDS, ROTATION_KICKS};

pub const HEIGHT: usize = 30;
pub const WIDTH: usize = 10;
/// Row new pieces are placed at
pub const SPAWN_ROW: i32 = 6;

/// Why a piece cannot go where it was asked to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collision {
    OutOfBounds,
    /// Overlaps another player's falling piece
    OtherPiece,
    /// Overlaps settled cells
    Settled,
}

impl Collision {
    /// Whether a piece blocked this way while falling has landed
    pub fn lands(self) -> bool {
        matches!(self, Collision::OutOfBounds | Collision::Settled)
    }
}

/// Horizontal or downward step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Left,
    Right,
    Down,
}

impl Step {
    fn offset(self) -> Point {
        match self {
            Step::Left => (0, -1),
            Step::Right => (0, 1),
            Step::Down => (1, 0),
        }
    }
}

pub struct Board {
    cells: Vec<[u8; WIDTH]>,
    /// Indexed by player slot; `None` only if a spawn never fitted
    falling: Vec<Option<Piece>>,
    queue: VecDeque<Piece>,
    /// Queue length kept above this so that many pieces can be previewed
    queue_preview: usize,
    rng: StdRng,
}

impl Board {
    /// Empty board with a freshly spawned piece for each of `players` slots
    pub fn new(players: usize, queue_preview: usize, rng: StdRng, now: Instant) -> Self {
        let mut board = Self {
            cells: vec![[0; WIDTH]; HEIGHT],
            falling: vec![None; players],
            queue: VecDeque::new(),
            queue_preview,
            rng,
        };
        for slot in 0..players {
            if board.spawn(slot, now).is_none() {
                tracing::warn!("No room to spawn a piece for slot {}", slot);
            }
        }
        board
    }

    /// Settled cells with every falling piece drawn over them
    pub fn map(&self) -> Vec<Vec<u8>> {
        let mut map: Vec<Vec<u8>> = self.cells.iter().map(|row| row.to_vec()).collect();
        for piece in self.falling.iter().flatten() {
            for (row, col) in piece.cells() {
                if in_bounds(row, col) {
                    map[row as usize][col as usize] = piece.color;
                }
            }
        }
        map
    }

    pub fn position(&self, slot: usize) -> Vec<Point> {
        self.piece(slot).map(Piece::cells).unwrap_or_default()
    }

    pub fn queue(&self) -> Vec<Form> {
        self.queue.iter().map(|piece| piece.form.clone()).collect()
    }

    /// How long the slot's piece has gone without moving down
    pub fn hang_time(&self, slot: usize, now: Instant) -> Option<Duration> {
        self.piece(slot)
            .map(|piece| now.saturating_duration_since(piece.dropped_at))
    }

    /// Check whether `piece` may be the falling piece of `slot`
    pub fn check(&self, slot: usize, piece: &Piece) -> Result<(), Collision> {
        let cells = piece.cells();
        if !cells.iter().all(|&(row, col)| in_bounds(row, col)) {
            return Err(Collision::OutOfBounds);
        }

        let hits_other = self
            .falling
            .iter()
            .enumerate()
            .any(|(other, falling)| other != slot && falling.as_ref().is_some_and(|f| f.overlaps(piece)));
        if hits_other {
            return Err(Collision::OtherPiece);
        }

        if cells
            .iter()
            .any(|&(row, col)| self.cells[row as usize][col as usize] != 0)
        {
            return Err(Collision::Settled);
        }
        Ok(())
    }

    /// Move the slot's piece one step. Moving down resets its gravity clock.
    pub fn step(&mut self, slot: usize, step: Step, now: Instant) -> Result<(), Collision> {
        let Some(piece) = self.piece(slot) else {
            return Ok(());
        };

        let mut moved = piece.moved(step.offset());
        if step == Step::Down {
            moved = moved.refreshed(now);
        }
        self.check(slot, &moved)?;
        self.falling[slot] = Some(moved);
        Ok(())
    }

    /// Rotate in place, or at the first kick offset that fits
    pub fn rotate(&mut self, slot: usize, clockwise: bool) -> bool {
        let Some(piece) = self.piece(slot) else {
            return false;
        };

        let rotated = piece.rotated(clockwise);
        let candidates = std::iter::once((0, 0)).chain(ROTATION_KICKS);
        for offset in candidates {
            let candidate = rotated.moved(offset);
            if self.check(slot, &candidate).is_ok() {
                self.falling[slot] = Some(candidate);
                return true;
            }
        }
        false
    }

    /// Drop the slot's piece as far as it goes and report what stopped it
    pub fn hard_drop(&mut self, slot: usize, now: Instant) -> Option<Collision> {
        let mut resting = self.piece(slot)?.clone();
        let blocked = loop {
            let next = resting.moved((1, 0));
            match self.check(slot, &next) {
                Ok(()) => resting = next,
                Err(collision) => break collision,
            }
        };
        self.falling[slot] = Some(resting.refreshed(now));
        Some(blocked)
    }

    /// Stamp the slot's piece into the grid, clear full rows and hand the slot the
    /// next queued piece.
    ///
    /// Returns the number of cleared rows, or `None` when the new piece fits nowhere
    /// on the spawn row.
    pub fn settle(&mut self, slot: usize, now: Instant) -> Option<u32> {
        if let Some(piece) = self.falling.get_mut(slot).and_then(Option::take) {
            for (row, col) in piece.cells() {
                if in_bounds(row, col) {
                    self.cells[row as usize][col as usize] = piece.color;
                }
            }
        }

        let cleared = self.clear_rows();
        self.spawn(slot, now).map(|()| cleared)
    }

    fn piece(&self, slot: usize) -> Option<&Piece> {
        self.falling.get(slot).and_then(Option::as_ref)
    }

    fn clear_rows(&mut self) -> u32 {
        self.cells.retain(|row| row.iter().any(|&cell| cell == 0));
        let cleared = HEIGHT - self.cells.len();
        for _ in 0..cleared {
            self.cells.insert(0, [0; WIDTH]);
        }
        cleared as u32
    }

    fn refill_queue(&mut self, now: Instant) {
        while self.queue.len() <= self.queue_preview {
            let mut bag: Vec<u8> = (1..=PIECE_KINDS).collect();
            bag.shuffle(&mut self.rng);
            self.queue
                .extend(bag.into_iter().map(|color| Piece::new(color, now)));
        }
    }

    fn spawn(&mut self, slot: usize, now: Instant) -> Option<()> {
        self.refill_queue(now);
        let next = self.queue.pop_front()?;

        let mut columns: Vec<i32> = (0..WIDTH as i32).collect();
        columns.shuffle(&mut self.rng);
        for col in columns {
            let candidate = next.moved((SPAWN_ROW, col)).refreshed(now);
            if self.check(slot, &candidate).is_ok() {
                self.falling[slot] = Some(candidate);
                return Some(());
            }
        }
        None
    }
}

fn in_bounds(row: i32, col: i32) -> bool {
    (0..HEIGHT as i32).contains(&row) && (0..WIDTH as i32).contains(&col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn board(players: usize) -> Board {
        Board::new(players, 3, StdRng::seed_from_u64(7), Instant::now())
    }

    fn filled_cells(board: &Board) -> usize {
        board
            .map()
            .iter()
            .flatten()
            .filter(|&&cell| cell != 0)
            .count()
    }

    #[test]
    fn test_new_board_spawns_every_slot() {
        let board = board(2);
        for slot in 0..2 {
            let cells = board.position(slot);
            assert_eq!(cells.len(), 4);
            assert!(cells.iter().all(|&(row, _)| row >= SPAWN_ROW));
        }
        assert!(board.queue().len() > 3);
        assert_eq!(filled_cells(&board), 8);
    }

    #[test]
    fn test_check_reports_collisions() {
        let mut board = board(2);
        let now = Instant::now();
        let mine = Piece::new(1, now).moved((20, 4));

        assert_eq!(board.check(0, &mine), Ok(()));
        assert_eq!(board.check(0, &mine.moved((9, 0))), Err(Collision::OutOfBounds));
        assert_eq!(board.check(0, &mine.moved((0, -5))), Err(Collision::OutOfBounds));

        board.cells[21][5] = 3;
        assert_eq!(board.check(0, &mine), Err(Collision::Settled));

        board.falling[1] = Some(Piece::new(1, now).moved((15, 0)));
        assert_eq!(board.check(0, &Piece::new(1, now).moved((16, 1))), Err(Collision::OtherPiece));
        // A slot never collides with its own piece.
        assert_eq!(board.check(1, &Piece::new(1, now).moved((16, 1))), Ok(()));
    }

    #[test]
    fn test_hard_drop_reaches_floor() {
        let mut board = board(1);
        let now = Instant::now();
        assert_eq!(board.hard_drop(0, now), Some(Collision::OutOfBounds));

        let bottom = board.position(0).iter().map(|&(row, _)| row).max();
        assert_eq!(bottom, Some(HEIGHT as i32 - 1));
    }

    #[test]
    fn test_settle_clears_full_rows() {
        let mut board = board(1);
        let now = Instant::now();
        board.falling[0] = Some(Piece::new(1, now).moved((20, 0)));
        board.cells[HEIGHT - 1] = [5; WIDTH];
        board.cells[HEIGHT - 2] = [5; WIDTH];
        board.cells[HEIGHT - 3][0] = 2;

        assert_eq!(board.settle(0, now), Some(2));
        assert_eq!(board.cells.len(), HEIGHT);
        assert_eq!(board.cells[HEIGHT - 1][0], 2);
        // The settled O piece moved down with the rest.
        assert_eq!(board.cells[22][0], 1);
        assert_eq!(board.cells[23][1], 1);
        assert_eq!(board.position(0).len(), 4);
    }

    #[test]
    fn test_settle_without_room_fails() {
        let mut board = board(1);
        let now = Instant::now();
        board.falling[0] = None;
        // Every row around the spawn row is full except the first column.
        for row in 4..=14 {
            board.cells[row] = [4; WIDTH];
            board.cells[row][0] = 0;
        }
        assert_eq!(board.settle(0, now), None);
        assert!(board.position(0).is_empty());
    }

    #[test]
    fn test_rotation_kicks_off_the_wall() {
        let mut board = board(1);
        let now = Instant::now();
        // Vertical I piece next to the left wall: rotating back to horizontal in
        // place would leave the board.
        let vertical = Piece::new(7, now).rotated(true).moved((10, -1));
        assert_eq!(board.check(0, &vertical), Ok(()));
        board.falling[0] = Some(vertical);

        assert!(board.rotate(0, false));
        assert!(board.position(0).iter().all(|&(_, col)| col >= 0));
    }

    #[test]
    fn test_queue_refills_above_preview() {
        let mut board = board(1);
        let now = Instant::now();
        for _ in 0..20 {
            board.falling[0] = None;
            board.cells = vec![[0; WIDTH]; HEIGHT];
            assert!(board.settle(0, now).is_some());
            assert!(board.queue().len() >= 3);
        }
    }
}
