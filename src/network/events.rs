// Session lifecycle types and the events every transport emits
// Consumers drain an EventReceiver and fold each event into their game state

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::TransportError;
use super::relay::RoomCode;
use crate::game::{Board, Mark};

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Which side of the session we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Created the session; always plays X
    Host,
    /// Joined an existing session; always plays O
    Client,
}

impl Role {
    pub fn mark(self) -> Mark {
        match self {
            Role::Host => Mark::X,
            Role::Client => Mark::O,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// A move seen by a transport.
///
/// LAN moves only carry the index and mark; relay moves also carry the
/// authoritative board and turn read back from the shared snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveEvent {
    pub index: usize,
    pub mark: Mark,
    pub board: Option<Board>,
    pub current_player: Option<Mark>,
}

impl MoveEvent {
    pub fn bare(index: usize, mark: Mark) -> Self {
        Self {
            index,
            mark,
            board: None,
            current_player: None,
        }
    }
}

/// Full game state pushed by the remote side.
///
/// `provisional` syncs come from the relay board fast path: only `board` is
/// meaningful, the other fields are placeholders until the full snapshot
/// lands right behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub board: Board,
    pub current_player: Mark,
    pub winner: Option<Mark>,
    pub is_draw: bool,
    pub provisional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Listening socket is bound (LAN host)
    Hosting { port: u16 },

    /// Room allocated and waiting for a claim (relay host)
    RoomCreated { code: RoomCode },

    /// Both sides are present; a new game starts
    Connected { role: Role },

    Move(MoveEvent),

    Sync(SyncState),

    /// Turn authority changed
    Turn { current_player: Mark, is_my_turn: bool },

    Reset { starting_mark: Mark },

    /// The joiner left; the host's room is open for a new claim
    PeerLeft,

    Disconnected,

    Error(TransportError),
}

/// Snapshot of a transport's session, like `getState()` in a UI store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub role: Option<Role>,
    pub status: ConnectionStatus,
    pub my_mark: Mark,
    pub opponent_mark: Mark,
    pub is_my_turn: bool,
    /// Relay sessions only
    pub room: Option<RoomCode>,
    /// LAN sessions only: the dialled address, or the bound port for a host
    pub remote_address: Option<String>,
    pub port: Option<u16>,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            role: None,
            status: ConnectionStatus::Disconnected,
            my_mark: Mark::X,
            opponent_mark: Mark::O,
            is_my_turn: false,
            room: None,
            remote_address: None,
            port: None,
        }
    }
}

impl SessionInfo {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Start a session as `role`: marks are fixed for its lifetime, host moves first
    pub fn begin(&mut self, role: Role) {
        self.role = Some(role);
        self.status = ConnectionStatus::Connecting;
        self.my_mark = role.mark();
        self.opponent_mark = role.mark().other();
        self.is_my_turn = role == Role::Host;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
