// Multiplayer networking
// Two transports share one contract: LocalTransport dials a peer directly on the
// LAN, RelayTransport pairs two clients through a shared realtime store

pub mod error;
pub mod events;
pub mod ip;
pub mod local;
pub mod protocol;
pub mod relay;

pub use error::{ErrorClass, TransportError};
pub use events::{
    ConnectionStatus, EventReceiver, EventSender, MoveEvent, Role, SessionInfo, SyncState,
    TransportEvent,
};
pub use ip::{discover_local_ip, LocalAddress};
pub use local::LocalTransport;
pub use relay::{RelayBackend, RelayTransport, RoomCode};

use async_trait::async_trait;

use crate::config::Config;
use crate::game::{Board, Mark};

/// Operations both transports support once a session exists.
///
/// Sends are best-effort: when not connected, or when turn authority says no,
/// they silently do nothing. Failures surface as `TransportEvent::Error`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send our move. `board` is the caller's view of the board *before* the
    /// move; the relay trusts it instead of reading the snapshot back.
    async fn send_move(&self, index: usize, board: Option<&Board>);

    async fn send_reset(&self, starting_mark: Mark);

    async fn send_sync(&self, state: &SyncState);

    /// Tear down the session. Safe from any state, including never connected.
    async fn disconnect(&self);

    fn session(&self) -> SessionInfo;

    fn is_my_turn(&self) -> bool {
        self.session().is_my_turn
    }

    fn set_my_turn(&self, is_my_turn: bool);
}

/// What this process can do, resolved once at startup and handed to the
/// transport constructors
#[derive(Clone)]
pub struct Capabilities {
    pub tcp: bool,
    pub relay: RelayBackend,
}

impl Capabilities {
    /// Probe the configured backends. Never fails: missing pieces become
    /// "unavailable" so the UI can explain how to set them up.
    pub async fn resolve(config: &Config) -> Self {
        Self {
            tcp: config.local.enabled,
            relay: RelayBackend::connect(&config.relay).await,
        }
    }
}
