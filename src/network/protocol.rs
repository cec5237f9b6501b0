// LAN wire protocol
// Newline-delimited JSON: one message per line, tagged by "type"

use serde::{Deserialize, Serialize};

use crate::game::{Board, Mark};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovePayload {
    pub index: usize,
    pub mark: Mark,
}

/// Messages exchanged between the two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    /// A single move by the sender
    Move { data: MovePayload },

    /// Start a new game
    Reset {
        #[serde(rename = "startingMark", default = "default_starting_mark")]
        starting_mark: Mark,
    },

    /// Full game state, sent after terminal moves so both sides agree
    Sync {
        board: Board,
        #[serde(rename = "currentPlayer")]
        current_player: Mark,
        #[serde(default)]
        winner: Option<Mark>,
        #[serde(rename = "isDraw", default)]
        is_draw: bool,
    },

    /// Liveness probe; answered with a pong echoing the timestamp
    Ping {
        #[serde(rename = "timestampMs", default)]
        timestamp_ms: u64,
    },

    Pong {
        #[serde(rename = "timestampMs", default)]
        timestamp_ms: u64,
    },

    /// Any type this build doesn't know; ignored on receipt
    #[serde(other)]
    Unknown,
}

fn default_starting_mark() -> Mark {
    Mark::X
}

impl WireMessage {
    /// Serialize to a single line, including the trailing newline
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (surrounding whitespace ignored)
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
