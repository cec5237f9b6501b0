// Session controller
// Owns the canonical game, picks one transport per game mode, and folds that
// transport's events into the game. Transport data always wins over our own
// optimistic prediction.

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::game::{BoardSize, GameState, Mark};
use crate::network::{
    Capabilities, EventReceiver, LocalTransport, RelayTransport, RoomCode, SessionInfo,
    SyncState, Transport, TransportError, TransportEvent,
};

/// Which game is being played, and over what
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameMode {
    /// Hot-seat on one device; any board size
    Offline(BoardSize),
    /// Direct TCP to a device on the same network
    Local,
    /// Through the relay server
    Relay,
}

pub struct SessionController {
    mode: GameMode,
    game: GameState,
    local: LocalTransport,
    local_events: EventReceiver,
    relay: RelayTransport,
    relay_events: EventReceiver,
    last_error: Option<TransportError>,
}

impl SessionController {
    pub fn new(config: &Config, capabilities: Capabilities) -> Self {
        let (local, local_events) = LocalTransport::new(config.local.clone(), capabilities.tcp);
        let (relay, relay_events) = RelayTransport::new(capabilities.relay, config.relay.clone());
        Self {
            mode: GameMode::Offline(BoardSize::Three),
            game: GameState::new(BoardSize::Three, Mark::X),
            local,
            local_events,
            relay,
            relay_events,
            last_error: None,
        }
    }

    pub fn mode(&self) -> GameMode {
        self.mode
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    pub fn local(&self) -> &LocalTransport {
        &self.local
    }

    pub fn relay(&self) -> &RelayTransport {
        &self.relay
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    /// The active transport, if the mode has one
    pub fn transport(&self) -> Option<&dyn Transport> {
        match self.mode {
            GameMode::Offline(_) => None,
            GameMode::Local => Some(&self.local),
            GameMode::Relay => Some(&self.relay),
        }
    }

    pub fn session(&self) -> Option<SessionInfo> {
        self.transport().map(|t| t.session())
    }

    /// My mark in a networked game
    pub fn my_mark(&self) -> Option<Mark> {
        self.session()
            .filter(|s| s.role.is_some())
            .map(|s| s.my_mark)
    }

    pub fn is_my_turn(&self) -> bool {
        match self.transport() {
            None => !self.game.is_over(),
            Some(transport) => transport.is_my_turn() && !self.game.is_over(),
        }
    }

    /// Switch modes. Leaving a networked mode tears its session down.
    pub async fn set_mode(&mut self, mode: GameMode) {
        if mode != self.mode {
            if let Some(transport) = self.transport() {
                transport.disconnect().await;
            }
            self.drain_inactive();
        }
        info!("Game mode: {:?}", mode);
        self.mode = mode;
        self.last_error = None;
        self.game = match mode {
            GameMode::Offline(size) => GameState::new(size, Mark::X),
            GameMode::Local | GameMode::Relay => GameState::network(),
        };
    }

    pub async fn host_local(&mut self, port: Option<u16>) -> Result<u16, TransportError> {
        self.set_mode(GameMode::Local).await;
        let port = port.unwrap_or_else(|| self.local.default_port());
        self.local.start_hosting(port).await
    }

    pub async fn join_local(&mut self, address: &str, port: Option<u16>) -> Result<(), TransportError> {
        self.set_mode(GameMode::Local).await;
        let port = port.unwrap_or_else(|| self.local.default_port());
        self.local.join_game(address, port).await
    }

    pub async fn create_room(&mut self) -> Result<RoomCode, TransportError> {
        self.set_mode(GameMode::Relay).await;
        self.relay.create_room().await
    }

    pub async fn join_room(&mut self, code: &str) -> Result<(), TransportError> {
        self.set_mode(GameMode::Relay).await;
        self.relay.join_room(code).await
    }

    /// The local player taps a cell. Returns whether the move was taken.
    pub async fn play(&mut self, index: usize) -> bool {
        let Some(session) = self.session() else {
            let mark = self.game.current_player;
            return self.game.apply_move(index, mark);
        };

        if !session.is_connected() || !self.is_my_turn() {
            debug!("Ignoring tap on {}: not our turn", index);
            return false;
        }

        let before = self.game.board.clone();
        if !self.game.apply_move(index, session.my_mark) {
            return false;
        }

        // LAN peers only get the index; follow a decisive move with the full state
        let follow_up =
            (self.mode == GameMode::Local && self.game.is_over()).then(|| self.sync_state());

        if let Some(transport) = self.transport() {
            transport.send_move(index, Some(&before)).await;
            if let Some(sync) = follow_up {
                transport.send_sync(&sync).await;
            }
        }
        true
    }

    /// Start a new game, `starting` to move first
    pub async fn reset(&mut self, starting: Mark) {
        if let Some(transport) = self.transport() {
            transport.send_reset(starting).await;
        }
        self.game.reset(starting);
    }

    /// End the networked session and return to offline play
    pub async fn leave(&mut self) {
        self.set_mode(GameMode::Offline(BoardSize::Three)).await;
    }

    /// Wait for the next event from the active transport and apply it.
    /// Never resolves in offline mode.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        let event = loop {
            let (from_local, event) = tokio::select! {
                event = self.local_events.recv() => (true, event),
                event = self.relay_events.recv() => (false, event),
            };
            let event = event?;
            let active = match self.mode {
                GameMode::Local => from_local,
                GameMode::Relay => !from_local,
                GameMode::Offline(_) => false,
            };
            if active {
                break event;
            }
            debug!("Dropping event from inactive transport: {:?}", event);
        };
        self.apply(&event);
        Some(event)
    }

    /// Fold one transport event into the canonical game
    pub fn apply(&mut self, event: &TransportEvent) {
        match event {
            TransportEvent::Connected { .. } | TransportEvent::PeerLeft => {
                self.game = GameState::network();
            }
            TransportEvent::Move(mv) => match &mv.board {
                Some(board) => {
                    self.game.board = board.clone();
                    self.game.current_player = mv.current_player.unwrap_or(mv.mark.other());
                    self.game.refresh_outcome();
                }
                None => {
                    if !self.game.apply_move(mv.index, mv.mark) {
                        warn!("Remote move {} by {} does not fit our board", mv.index, mv.mark);
                    }
                }
            },
            TransportEvent::Sync(sync) => {
                self.game.board = sync.board.clone();
                if !sync.provisional {
                    self.game.current_player = sync.current_player;
                    self.game.winner = sync.winner;
                    self.game.is_draw = sync.is_draw;
                }
            }
            TransportEvent::Turn { current_player, .. } => {
                self.game.current_player = *current_player;
            }
            TransportEvent::Reset { starting_mark } => {
                self.game = GameState::new(BoardSize::Three, *starting_mark);
            }
            TransportEvent::Error(e) => {
                self.last_error = Some(e.clone());
            }
            TransportEvent::Hosting { .. }
            | TransportEvent::RoomCreated { .. }
            | TransportEvent::Disconnected => {}
        }
    }

    fn sync_state(&self) -> SyncState {
        SyncState {
            board: self.game.board.clone(),
            current_player: self.game.current_player,
            winner: self.game.winner,
            is_draw: self.game.is_draw,
            provisional: false,
        }
    }

    fn drain_inactive(&mut self) {
        while self.local_events.try_recv().is_ok() {}
        while self.relay_events.try_recv().is_ok() {}
    }
}
