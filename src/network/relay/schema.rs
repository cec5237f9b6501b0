// Records kept in the relay store under a room code R
//
//   rooms/R = { host: true, player2: bool, createdAt: epoch-ms }
//   games/R = { board: [9 x "X"|"O"|null], currentPlayer, winner, isDraw, lastMove }

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::store::StoreError;
use crate::game::{Board, Mark, NETWORK_CELLS};
use crate::network::events::SyncState;

const CODE_LEN: usize = 6;
const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub const FIELD_BOARD: &str = "board";
pub const FIELD_CURRENT_PLAYER: &str = "currentPlayer";
pub const FIELD_WINNER: &str = "winner";
pub const FIELD_IS_DRAW: &str = "isDraw";
pub const FIELD_LAST_MOVE: &str = "lastMove";
pub const FIELD_PLAYER2: &str = "player2";

/// Six-character uppercase alphanumeric room code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Three characters from the clock plus three random ones
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut code = String::with_capacity(CODE_LEN);

        let mut clock = now_ms();
        let mut prefix = [0u8; 3];
        for slot in prefix.iter_mut().rev() {
            *slot = ALPHABET[(clock % 36) as usize];
            clock /= 36;
        }
        code.extend(prefix.iter().map(|&b| b as char));
        code.extend((0..CODE_LEN - 3).map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char));

        RoomCode(code)
    }

    /// Accept a code typed by a player; case and surrounding spaces don't matter
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().to_ascii_uppercase();
        if code.len() == CODE_LEN && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Some(RoomCode(code))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn room_path(&self) -> String {
        format!("rooms/{}", self.0)
    }

    pub fn game_path(&self) -> String {
        format!("games/{}", self.0)
    }

    pub fn game_field(&self, field: &str) -> String {
        format!("games/{}/{}", self.0, field)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRecord {
    #[serde(default)]
    pub host: bool,
    #[serde(default)]
    pub player2: bool,
    #[serde(rename = "createdAt", default)]
    pub created_at: u64,
}

impl RoomRecord {
    pub fn open() -> Self {
        Self {
            host: true,
            player2: false,
            created_at: now_ms(),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Result<Value, StoreError> {
        serde_json::to_value(self).map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

/// Pointer to the most recent move, watched for move-by-move delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMove {
    pub index: usize,
    pub mark: Mark,
}

impl LastMove {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value::<LastMove>(value.clone())
            .ok()
            .filter(|mv| mv.index < NETWORK_CELLS)
    }
}

/// The shared game record; the single source of truth for relay play
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    #[serde(deserialize_with = "lenient_board", default = "Board::network")]
    pub board: Board,
    #[serde(default = "first_mover")]
    pub current_player: Mark,
    #[serde(default)]
    pub winner: Option<Mark>,
    #[serde(default)]
    pub is_draw: bool,
    #[serde(default)]
    pub last_move: Option<LastMove>,
}

impl GameSnapshot {
    pub fn fresh(starting: Mark) -> Self {
        Self {
            board: Board::network(),
            current_player: starting,
            winner: None,
            is_draw: false,
            last_move: None,
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Result<Value, StoreError> {
        serde_json::to_value(self).map_err(|e| StoreError::Malformed(e.to_string()))
    }

    /// Every field of a fresh game, for a multi-field update
    pub fn fresh_fields(starting: Mark) -> Result<Map<String, Value>, StoreError> {
        match Self::fresh(starting).to_value()? {
            Value::Object(mut fields) => {
                // Explicit nulls so an update clears these fields
                fields.insert(FIELD_WINNER.to_string(), Value::Null);
                fields.insert(FIELD_LAST_MOVE.to_string(), Value::Null);
                Ok(fields)
            }
            other => Err(StoreError::Malformed(format!("snapshot encoded as {}", other))),
        }
    }

    pub fn to_sync(&self) -> SyncState {
        SyncState {
            board: self.board.clone(),
            current_player: self.current_player,
            winner: self.winner,
            is_draw: self.is_draw,
            provisional: false,
        }
    }
}

fn first_mover() -> Mark {
    Mark::X
}

/// Read a board however the store hands it back: a full array, a short
/// array with trailing nulls dropped, or a sparse object keyed by index
pub fn board_from_value(value: &Value) -> Board {
    let mut cells = vec![None; NETWORK_CELLS];
    match value {
        Value::Array(items) => {
            for (cell, item) in cells.iter_mut().zip(items) {
                *cell = mark_from_value(item);
            }
        }
        Value::Object(entries) => {
            for (key, item) in entries {
                if let Ok(index) = key.parse::<usize>() {
                    if index < NETWORK_CELLS {
                        cells[index] = mark_from_value(item);
                    }
                }
            }
        }
        _ => {}
    }
    Board::normalized(cells)
}

pub fn mark_from_value(value: &Value) -> Option<Mark> {
    serde_json::from_value(value.clone()).ok()
}

fn lenient_board<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Board, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(board_from_value(&value))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
