//! Falling pieces
//!
//! A piece is a square form matrix anchored at a board position. Pieces are values:
//! moving or rotating yields a new piece, which the board then accepts or rejects.

use std::time::Instant;

/// `(row, column)` on the board, row 0 at the top
pub type Point = (i32, i32);

/// Square 0/1 matrix describing a piece's shape
pub type Form = Vec<Vec<u8>>;

/// Number of distinct pieces; colours run from 1 to this value
pub const PIECE_KINDS: u8 = 7;

/// Neighbour offsets tried, in order, when a rotation does not fit in place
pub const ROTATION_KICKS: [Point; 8] = [
    (1, -1),
    (1, 0),
    (1, 1),
    (0, -1),
    (0, 1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
];

/// Initial form of the piece with the given colour (1-based)
pub fn base_form(color: u8) -> Form {
    let rows: &[&[u8]] = match color {
        1 => &[&[1, 1], &[1, 1]],
        2 => &[&[0, 1, 1], &[1, 1, 0], &[0, 0, 0]],
        3 => &[&[1, 1, 0], &[0, 1, 1], &[0, 0, 0]],
        4 => &[&[1, 0, 0], &[1, 1, 1], &[0, 0, 0]],
        5 => &[&[0, 0, 1], &[1, 1, 1], &[0, 0, 0]],
        6 => &[&[0, 1, 0], &[1, 1, 1], &[0, 0, 0]],
        _ => &[&[0, 0, 0, 0], &[1, 1, 1, 1], &[0, 0, 0, 0], &[0, 0, 0, 0]],
    };
    rows.iter().map(|row| row.to_vec()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    /// Board position of the form's top-left corner
    pub origin: Point,
    pub color: u8,
    pub form: Form,
    /// When the piece last spawned or moved down; drives gravity
    pub dropped_at: Instant,
}

impl Piece {
    pub fn new(color: u8, now: Instant) -> Self {
        Self {
            origin: (0, 0),
            color,
            form: base_form(color),
            dropped_at: now,
        }
    }

    /// Board cells the piece covers
    pub fn cells(&self) -> Vec<Point> {
        let (row, col) = self.origin;
        let mut cells = Vec::with_capacity(4);
        for (i, line) in self.form.iter().enumerate() {
            for (j, &filled) in line.iter().enumerate() {
                if filled != 0 {
                    cells.push((row + i as i32, col + j as i32));
                }
            }
        }
        cells
    }

    pub fn moved(&self, (dr, dc): Point) -> Self {
        Self {
            origin: (self.origin.0 + dr, self.origin.1 + dc),
            ..self.clone()
        }
    }

    /// Same piece with its gravity clock reset
    pub fn refreshed(&self, now: Instant) -> Self {
        Self {
            dropped_at: now,
            ..self.clone()
        }
    }

    pub fn rotated(&self, clockwise: bool) -> Self {
        let n = self.form.len();
        let mut form = vec![vec![0; n]; n];
        for (i, line) in form.iter_mut().enumerate() {
            for (j, cell) in line.iter_mut().enumerate() {
                *cell = if clockwise {
                    self.form[n - 1 - j][i]
                } else {
                    self.form[j][n - 1 - i]
                };
            }
        }
        Self {
            form,
            ..self.clone()
        }
    }

    pub fn overlaps(&self, other: &Piece) -> bool {
        let mine = self.cells();
        other.cells().iter().any(|cell| mine.contains(cell))
    }
}
