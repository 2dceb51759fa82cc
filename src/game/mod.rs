//! Game module - The falling-block simulation both players share
//!
//! The simulation itself only runs on the hosting side; the guest mirrors it through
//! [`Snapshot`]s and forwards [`Control`]s.

mod board;
mod piece;
mod tetris;

pub use piece::{Form, Point};
pub use tetris::Tetris;

use serde::{Deserialize, Serialize};

/// Game lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Waiting,
    Playing,
    Ended,
}

/// One player input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    MoveLeft,
    MoveRight,
    MoveDown,
    #[serde(rename = "superdown")]
    HardDrop,
    Rotate,
}

/// Everything a remote player needs to draw the game
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    /// Board rows, 0 for empty, piece colour otherwise
    pub map: Vec<Vec<u8>>,
    pub score: u64,
    pub queue: Vec<Form>,
    /// Player names by slot
    pub players: Vec<String>,
    /// Falling piece cells by slot
    pub positions: Vec<Vec<Point>>,
    pub phase: Phase,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_names() {
        assert_eq!(serde_json::to_value(Control::MoveLeft).unwrap(), "move_left");
        assert_eq!(serde_json::to_value(Control::HardDrop).unwrap(), "superdown");
        let parsed: Control = serde_json::from_value(serde_json::json!("rotate")).unwrap();
        assert_eq!(parsed, Control::Rotate);
    }
}
