// Internet play through the shared relay store
// The host allocates rooms/R and games/R; the joiner claims rooms/R with a
// transaction. After that both sides write moves into games/R and react to
// field watches, so the store is the only source of truth.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::dedup::MoveDeduper;
use super::memory::MemoryClient;
use super::remote::WsStore;
use super::schema::{
    board_from_value, mark_from_value, GameSnapshot, LastMove, RoomCode, RoomRecord,
    FIELD_BOARD, FIELD_CURRENT_PLAYER, FIELD_IS_DRAW, FIELD_LAST_MOVE, FIELD_PLAYER2,
    FIELD_WINNER,
};
use super::store::{
    run_transaction, DisconnectAction, RelayStore, StoreError, TxOutcome, TxStep, WatchId,
};
use crate::config::RelayConfig;
use crate::game::{evaluate_winner, is_board_full, Board, Mark, NETWORK_CELLS};
use crate::network::error::TransportError;
use crate::network::events::{
    ConnectionStatus, EventReceiver, EventSender, MoveEvent, Role, SessionInfo, SyncState,
    TransportEvent,
};
use crate::network::Transport;

const MAX_CODE_ATTEMPTS: usize = 5;

/// Whether internet play can work in this process
#[derive(Clone)]
pub enum RelayBackend {
    Available(Arc<dyn RelayStore>),
    Unavailable { reason: String },
}

impl RelayBackend {
    /// Connect to the configured relay server
    pub async fn connect(config: &RelayConfig) -> Self {
        let url = config.server_url.trim();
        if url.is_empty() {
            return RelayBackend::Unavailable {
                reason: "no relay server configured (set relay.server_url)".to_string(),
            };
        }

        match WsStore::connect(url, config.connect_timeout()).await {
            Ok(store) => RelayBackend::Available(Arc::new(store)),
            Err(e) => {
                warn!("Relay server unavailable: {}", e);
                RelayBackend::Unavailable {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Use an in-process store connection
    pub fn memory(client: MemoryClient) -> Self {
        RelayBackend::Available(Arc::new(client))
    }

    pub fn is_available(&self) -> bool {
        matches!(self, RelayBackend::Available(_))
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match self {
            RelayBackend::Available(_) => None,
            RelayBackend::Unavailable { reason } => Some(reason),
        }
    }

    fn store(&self) -> Result<Arc<dyn RelayStore>, TransportError> {
        match self {
            RelayBackend::Available(store) => Ok(store.clone()),
            RelayBackend::Unavailable { reason } => {
                Err(TransportError::RelayUnavailable(reason.clone()))
            }
        }
    }
}

/// Fields watched for the life of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Room,
    CurrentPlayer,
    Board,
    LastMove,
    Winner,
    IsDraw,
}

impl Field {
    const ALL: [Field; 6] = [
        Field::Room,
        Field::CurrentPlayer,
        Field::Board,
        Field::LastMove,
        Field::Winner,
        Field::IsDraw,
    ];

    fn path(self, code: &RoomCode) -> String {
        match self {
            Field::Room => code.room_path(),
            Field::CurrentPlayer => code.game_field(FIELD_CURRENT_PLAYER),
            Field::Board => code.game_field(FIELD_BOARD),
            Field::LastMove => code.game_field(FIELD_LAST_MOVE),
            Field::Winner => code.game_field(FIELD_WINNER),
            Field::IsDraw => code.game_field(FIELD_IS_DRAW),
        }
    }
}

pub struct RelayTransport {
    inner: Arc<Inner>,
}

struct Inner {
    backend: RelayBackend,
    config: RelayConfig,
    events: EventSender,
    state: Mutex<RelayState>,
}

struct RelayState {
    session: SessionInfo,
    is_host: bool,
    /// Bumped on every teardown; watch handlers from an older room go quiet
    generation: u64,
    /// Joiner only: we hold the player2 claim and must release it on leave
    claimed: bool,
    /// Host only: a joiner has been seen at least once
    was_joined: bool,
    resetting: bool,
    reset_epoch: u64,
    dedup: MoveDeduper,
    watches: Vec<WatchId>,
}

impl RelayState {
    fn new(config: &RelayConfig) -> Self {
        Self {
            session: SessionInfo::default(),
            is_host: false,
            generation: 0,
            claimed: false,
            was_joined: false,
            resetting: false,
            reset_epoch: 0,
            dedup: MoveDeduper::new(config.dedup_window()),
            watches: Vec::new(),
        }
    }

    /// Local half of a teardown: end the generation and clear the session
    fn forget(&mut self) -> Option<Leftovers> {
        self.generation += 1;
        let leftovers = self.session.room.take().map(|code| Leftovers {
            code,
            is_host: self.is_host,
            claimed: self.claimed,
            watches: std::mem::take(&mut self.watches),
        });
        self.session.clear();
        self.is_host = false;
        self.claimed = false;
        self.was_joined = false;
        self.resetting = false;
        self.dedup.clear();
        self.watches.clear();
        leftovers
    }
}

/// What a teardown has to clean up remotely
struct Leftovers {
    code: RoomCode,
    is_host: bool,
    claimed: bool,
    watches: Vec<WatchId>,
}

impl RelayTransport {
    pub fn new(backend: RelayBackend, config: RelayConfig) -> (Self, EventReceiver) {
        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        let state = Mutex::new(RelayState::new(&config));
        let inner = Arc::new(Inner {
            backend,
            config,
            events,
            state,
        });
        (Self { inner }, rx)
    }

    pub fn is_available(&self) -> bool {
        self.inner.backend.is_available()
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        self.inner.backend.unavailable_reason()
    }

    pub fn room_code(&self) -> Option<RoomCode> {
        self.inner.lock().session.room.clone()
    }

    /// Allocate a fresh room and wait for someone to claim it
    pub async fn create_room(&self) -> Result<RoomCode, TransportError> {
        let store = match self.inner.backend.store() {
            Ok(store) => store,
            Err(e) => return self.inner.reject(e),
        };

        // A room still waiting for its joiner is simply replaced
        let connected = self.inner.lock().session.is_connected();
        if connected {
            return self.inner.reject(TransportError::AlreadyConnected);
        }

        self.inner.teardown().await;
        let generation = self.inner.begin(Role::Host);

        let code = match allocate_room(store.as_ref()).await {
            Ok(code) => code,
            Err(e) => return self.inner.fail(generation, e).await,
        };
        info!("Allocated room {}", code);

        let replaced = {
            let mut st = self.inner.lock();
            if st.generation == generation {
                st.session.room = Some(code.clone());
                st.is_host = true;
            }
            st.generation != generation
        };
        if replaced {
            let _ = store.remove(&code.room_path()).await;
            return Err(TransportError::ConnectionLost("session was replaced".into()));
        }

        let snapshot = match GameSnapshot::fresh(Mark::X).to_value() {
            Ok(snapshot) => snapshot,
            Err(e) => return self.inner.fail(generation, e.into()).await,
        };
        if let Err(e) = store.set(&code.game_path(), snapshot).await {
            return self.inner.fail(generation, e.into()).await;
        }

        for path in [code.room_path(), code.game_path()] {
            if let Err(e) = store.on_disconnect(&path, DisconnectAction::Remove).await {
                warn!("Could not register cleanup for {}: {}", path, e);
            }
        }

        self.inner.emit(TransportEvent::RoomCreated { code: code.clone() });

        if let Err(e) = self.inner.clone().subscribe(generation, store, code.clone()).await {
            return self.inner.fail(generation, e).await;
        }

        if let Some(limit) = self.inner.config.claim_timeout() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                let unclaimed = {
                    let st = inner.lock();
                    st.generation == generation && !st.was_joined
                };
                if unclaimed {
                    warn!("Nobody claimed room within {:?}", limit);
                    let _ = inner
                        .fail::<()>(
                            generation,
                            TransportError::HostTimedOut {
                                secs: limit.as_secs(),
                            },
                        )
                        .await;
                }
            });
        }

        Ok(code)
    }

    /// Claim someone else's room
    pub async fn join_room(&self, raw_code: &str) -> Result<(), TransportError> {
        let store = match self.inner.backend.store() {
            Ok(store) => store,
            Err(e) => return self.inner.reject(e),
        };

        let Some(code) = RoomCode::parse(raw_code) else {
            return self
                .inner
                .reject(TransportError::InvalidRoomCode(raw_code.trim().to_string()));
        };

        {
            let st = self.inner.lock();
            if let Some(room) = &st.session.room {
                if st.is_host && *room == code {
                    return self.inner.reject(TransportError::OwnRoom);
                }
                if st.session.is_connected() {
                    return self.inner.reject(if *room == code {
                        TransportError::AlreadyInRoom
                    } else {
                        TransportError::AlreadyConnected
                    });
                }
            }
        }

        self.inner.teardown().await;
        let generation = self.inner.begin(Role::Client);
        self.inner.lock().session.room = Some(code.clone());

        let room_path = code.room_path();
        match store.get(&room_path).await {
            Err(e) => return self.inner.fail(generation, e.into()).await,
            Ok(None) => return self.inner.fail(generation, TransportError::RoomNotFound).await,
            Ok(Some(room)) => {
                if RoomRecord::from_value(&room).is_some_and(|r| r.player2) {
                    return self.inner.fail(generation, TransportError::RoomFull).await;
                }
            }
        }

        let claim = run_transaction(store.as_ref(), &room_path, |current| {
            match current.and_then(RoomRecord::from_value) {
                Some(room) if !room.player2 => {
                    let claimed = RoomRecord {
                        player2: true,
                        ..room
                    };
                    match claimed.to_value() {
                        Ok(value) => TxStep::Commit(Some(value)),
                        Err(_) => TxStep::Abort,
                    }
                }
                _ => TxStep::Abort,
            }
        })
        .await;

        match claim {
            Ok(TxOutcome::Committed(_)) => {}
            Ok(TxOutcome::Aborted(current)) => {
                let err = if current.as_ref().and_then(RoomRecord::from_value).is_some() {
                    TransportError::RoomFull
                } else {
                    TransportError::RoomNotFound
                };
                return self.inner.fail(generation, err).await;
            }
            Err(e) => return self.inner.fail(generation, e.into()).await,
        }

        {
            let mut st = self.inner.lock();
            if st.generation != generation {
                return Err(TransportError::ConnectionLost("session was replaced".into()));
            }
            st.claimed = true;
        }
        info!("Claimed room {}", code);

        let mut release = Map::new();
        release.insert(FIELD_PLAYER2.to_string(), Value::Bool(false));
        if let Err(e) = store
            .on_disconnect(&room_path, DisconnectAction::Update { fields: release })
            .await
        {
            warn!("Could not register release of {}: {}", room_path, e);
        }

        let fresh = match GameSnapshot::fresh_fields(Mark::X) {
            Ok(fresh) => fresh,
            Err(e) => return self.inner.fail(generation, e.into()).await,
        };
        if let Err(e) = store.update(&code.game_path(), fresh).await {
            return self.inner.fail(generation, e.into()).await;
        }

        {
            let mut st = self.inner.lock();
            if st.generation != generation {
                return Err(TransportError::ConnectionLost("session was replaced".into()));
            }
            st.session.status = ConnectionStatus::Connected;
        }
        self.inner.emit(TransportEvent::Connected { role: Role::Client });

        if let Err(e) = self
            .inner
            .clone()
            .subscribe(generation, store.clone(), code.clone())
            .await
        {
            return self.inner.fail(generation, e).await;
        }
        self.inner.seed(generation, store.as_ref(), &code).await;

        Ok(())
    }
}

async fn allocate_room(store: &dyn RelayStore) -> Result<RoomCode, TransportError> {
    let record = RoomRecord::open().to_value()?;
    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = RoomCode::generate();
        let outcome = store
            .compare_and_set(&code.room_path(), None, Some(record.clone()))
            .await?;
        if outcome.committed {
            return Ok(code);
        }
        debug!("Room code {} already taken, drawing another", code);
    }
    Err(StoreError::Contention("rooms".to_string()).into())
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    /// Emit only while `generation` is still the live session
    fn emit_current(&self, generation: u64, event: TransportEvent) {
        if self.lock().generation == generation {
            self.emit(event);
        }
    }

    fn store(&self) -> Option<Arc<dyn RelayStore>> {
        self.backend.store().ok()
    }

    fn begin(&self, role: Role) -> u64 {
        let mut st = self.lock();
        st.session.begin(role);
        st.is_host = role == Role::Host;
        st.generation
    }

    /// Refuse a request without touching the current session
    fn reject<T>(&self, err: TransportError) -> Result<T, TransportError> {
        warn!("Relay request refused: {}", err);
        self.emit(TransportEvent::Error(err.clone()));
        Err(err)
    }

    /// Abandon the session being set up and report why
    async fn fail<T>(&self, generation: u64, err: TransportError) -> Result<T, TransportError> {
        if self.lock().generation != generation {
            return Err(err);
        }
        warn!("Relay session failed: {}", err);
        self.teardown().await;
        self.lock().session.status = ConnectionStatus::Error;
        self.emit(TransportEvent::Error(err.clone()));
        Err(err)
    }

    /// Forget the session locally, then undo our footprint in the store.
    /// Returns whether there was a room to leave.
    async fn teardown(&self) -> bool {
        let leftovers = self.lock().forget();
        let Some(left) = leftovers else {
            return false;
        };
        let Some(store) = self.store() else {
            return true;
        };

        for id in left.watches {
            if let Err(e) = store.unwatch(id).await {
                debug!("Unwatch failed: {}", e);
            }
        }
        for path in [left.code.room_path(), left.code.game_path()] {
            if let Err(e) = store.cancel_on_disconnect(&path).await {
                debug!("Could not cancel cleanup for {}: {}", path, e);
            }
        }

        if left.is_host {
            for path in [left.code.room_path(), left.code.game_path()] {
                if let Err(e) = store.remove(&path).await {
                    warn!("Failed to remove {}: {}", path, e);
                }
            }
            info!("Closed room {}", left.code);
        } else if left.claimed {
            release_claim(store.as_ref(), &left.code).await;
            info!("Left room {}", left.code);
        }

        true
    }

    /// Every watch closed under a live session: the store connection is gone.
    /// Its disconnect directives clean up remotely, so only local state goes.
    fn on_store_lost(&self, generation: u64, code: &RoomCode) {
        {
            let mut st = self.lock();
            if st.generation != generation || st.forget().is_none() {
                return;
            }
            st.session.status = ConnectionStatus::Error;
        }
        warn!("Lost the relay connection while in room {}", code);
        self.emit(TransportEvent::Error(TransportError::ConnectionLost(
            "the relay server stopped responding".to_string(),
        )));
        self.emit(TransportEvent::Disconnected);
    }

    /// Watch every session field and handle changes in order on one task
    async fn subscribe(
        self: Arc<Self>,
        generation: u64,
        store: Arc<dyn RelayStore>,
        code: RoomCode,
    ) -> Result<(), TransportError> {
        let mut streams: Vec<BoxStream<'static, (Field, Option<Value>)>> = Vec::new();

        for field in Field::ALL {
            let watch = store.watch(&field.path(&code)).await?;
            let stale = {
                let mut st = self.lock();
                if st.generation == generation {
                    st.watches.push(watch.id);
                }
                st.generation != generation
            };
            if stale {
                let _ = store.unwatch(watch.id).await;
                return Ok(());
            }
            let changes = watch.changes;
            streams.push(
                stream::unfold(changes, move |mut changes| async move {
                    changes.recv().await.map(|value| ((field, value), changes))
                })
                .boxed(),
            );
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let mut merged = stream::select_all(streams);
            while let Some((field, value)) = merged.next().await {
                if inner.lock().generation != generation {
                    break;
                }
                inner
                    .on_change(generation, store.as_ref(), &code, field, value)
                    .await;
            }
            inner.on_store_lost(generation, &code);
            debug!("Watch handler for room {} finished", code);
        });

        Ok(())
    }

    async fn on_change(
        &self,
        generation: u64,
        store: &dyn RelayStore,
        code: &RoomCode,
        field: Field,
        value: Option<Value>,
    ) {
        match field {
            Field::Room => self.on_room(generation, store, code, value).await,
            Field::CurrentPlayer => {
                let Some(current) = value.as_ref().and_then(mark_from_value) else {
                    return;
                };
                let is_my_turn = {
                    let mut st = self.lock();
                    if st.generation != generation {
                        return;
                    }
                    st.session.is_my_turn = current == st.session.my_mark;
                    st.session.is_my_turn
                };
                self.emit_current(
                    generation,
                    TransportEvent::Turn {
                        current_player: current,
                        is_my_turn,
                    },
                );
            }
            Field::Board => {
                let Some(value) = value else {
                    return;
                };
                // Board first, so the grid redraws before the full read lands
                self.emit_current(
                    generation,
                    TransportEvent::Sync(SyncState {
                        board: board_from_value(&value),
                        current_player: Mark::X,
                        winner: None,
                        is_draw: false,
                        provisional: true,
                    }),
                );
                if let Some(snapshot) = self.fetch(store, code).await {
                    self.emit_current(generation, TransportEvent::Sync(snapshot.to_sync()));
                }
            }
            Field::LastMove => {
                let Some(mv) = value.as_ref().and_then(LastMove::from_value) else {
                    self.lock().dedup.clear();
                    return;
                };
                {
                    let mut st = self.lock();
                    if st.generation != generation {
                        return;
                    }
                    if st.dedup.is_duplicate(mv, Instant::now()) {
                        debug!("Dropping repeated move {:?}", mv);
                        return;
                    }
                }
                match self.fetch(store, code).await {
                    Some(snapshot) => {
                        self.emit_current(
                            generation,
                            TransportEvent::Move(MoveEvent {
                                index: mv.index,
                                mark: mv.mark,
                                board: Some(snapshot.board.clone()),
                                current_player: Some(snapshot.current_player),
                            }),
                        );
                        self.emit_current(generation, TransportEvent::Sync(snapshot.to_sync()));
                    }
                    None => self.emit_current(
                        generation,
                        TransportEvent::Move(MoveEvent::bare(mv.index, mv.mark)),
                    ),
                }
            }
            Field::Winner | Field::IsDraw => {
                let decided = match field {
                    Field::Winner => value.as_ref().and_then(mark_from_value).is_some(),
                    _ => value == Some(Value::Bool(true)),
                };
                if !decided || self.lock().resetting {
                    return;
                }
                if let Some(snapshot) = self.fetch(store, code).await {
                    self.emit_current(generation, TransportEvent::Sync(snapshot.to_sync()));
                }
            }
        }
    }

    async fn on_room(
        &self,
        generation: u64,
        store: &dyn RelayStore,
        code: &RoomCode,
        value: Option<Value>,
    ) {
        let record = value.as_ref().and_then(RoomRecord::from_value);

        let (is_host, status) = {
            let st = self.lock();
            if st.generation != generation {
                return;
            }
            (st.is_host, st.session.status)
        };

        match (is_host, record) {
            (true, Some(room)) if room.player2 && status != ConnectionStatus::Connected => {
                {
                    let mut st = self.lock();
                    if st.generation != generation {
                        return;
                    }
                    st.session.status = ConnectionStatus::Connected;
                    st.was_joined = true;
                }
                info!("Room {} claimed", code);
                self.emit(TransportEvent::Connected { role: Role::Host });
                self.seed(generation, store, code).await;
            }
            (true, Some(room)) if !room.player2 && status == ConnectionStatus::Connected => {
                {
                    let mut st = self.lock();
                    if st.generation != generation {
                        return;
                    }
                    st.session.status = ConnectionStatus::Connecting;
                }
                info!("Opponent left room {}", code);
                self.emit(TransportEvent::PeerLeft);
            }
            (_, None) => {
                warn!("Room {} closed", code);
                self.teardown().await;
                self.emit(TransportEvent::Error(TransportError::RoomClosed));
                self.emit(TransportEvent::Disconnected);
            }
            _ => {}
        }
    }

    /// Read the snapshot once and push it as the starting state
    async fn seed(&self, generation: u64, store: &dyn RelayStore, code: &RoomCode) {
        let Some(snapshot) = self.fetch(store, code).await else {
            return;
        };
        let is_my_turn = {
            let mut st = self.lock();
            if st.generation != generation {
                return;
            }
            st.session.is_my_turn = snapshot.current_player == st.session.my_mark;
            st.session.is_my_turn
        };
        self.emit_current(generation, TransportEvent::Sync(snapshot.to_sync()));
        self.emit_current(
            generation,
            TransportEvent::Turn {
                current_player: snapshot.current_player,
                is_my_turn,
            },
        );
    }

    async fn fetch(&self, store: &dyn RelayStore, code: &RoomCode) -> Option<GameSnapshot> {
        match store.get(&code.game_path()).await {
            Ok(Some(value)) => GameSnapshot::from_value(&value),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read game {}: {}", code, e);
                None
            }
        }
    }

    /// Live session handles, or None when not connected
    fn live(&self) -> Option<(u64, RoomCode, Mark, Arc<dyn RelayStore>)> {
        let st = self.lock();
        if !st.session.is_connected() {
            return None;
        }
        let code = st.session.room.clone()?;
        let store = self.store()?;
        Some((st.generation, code, st.session.my_mark, store))
    }
}

/// Give the player2 slot back, unless the room is already gone
async fn release_claim(store: &dyn RelayStore, code: &RoomCode) {
    let result = run_transaction(store, &code.room_path(), |current| {
        match current.and_then(RoomRecord::from_value) {
            Some(room) if room.player2 => match (RoomRecord {
                player2: false,
                ..room
            })
            .to_value()
            {
                Ok(value) => TxStep::Commit(Some(value)),
                Err(_) => TxStep::Abort,
            },
            _ => TxStep::Abort,
        }
    })
    .await;
    if let Err(e) = result {
        warn!("Failed to release room {}: {}", code, e);
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send_move(&self, index: usize, board: Option<&Board>) {
        if index >= NETWORK_CELLS {
            return;
        }
        let Some((generation, code, my_mark, store)) = self.inner.live() else {
            return;
        };

        // Take the turn before any await so a second call can't slip in
        {
            let mut st = self.inner.lock();
            if st.generation != generation || !st.session.is_my_turn {
                return;
            }
            st.session.is_my_turn = false;
        }

        let base = match board {
            Some(board) if board.len() == NETWORK_CELLS => Some(board.clone()),
            _ => self.inner.fetch(store.as_ref(), &code).await.map(|s| s.board),
        };
        let Some(mut next) = base else {
            warn!("No board to apply move {} to", index);
            self.inner.lock().session.is_my_turn = true;
            return;
        };
        if !next.place(index, my_mark) {
            debug!("Cell {} is already taken", index);
            self.inner.lock().session.is_my_turn = true;
            return;
        }

        let winner = evaluate_winner(&next);
        let is_draw = winner.is_none() && is_board_full(&next);
        let current_player = my_mark.other();
        let last = LastMove {
            index,
            mark: my_mark,
        };

        let mut fields = Map::new();
        match serde_json::to_value(&next) {
            Ok(board) => fields.insert(FIELD_BOARD.to_string(), board),
            Err(e) => {
                warn!("Failed to encode board: {}", e);
                self.inner.lock().session.is_my_turn = true;
                return;
            }
        };
        fields.insert(FIELD_CURRENT_PLAYER.to_string(), current_player.to_string().into());
        fields.insert(
            FIELD_LAST_MOVE.to_string(),
            serde_json::json!({ "index": last.index, "mark": last.mark }),
        );
        fields.insert(
            FIELD_WINNER.to_string(),
            winner.map_or(Value::Null, |w| w.to_string().into()),
        );
        fields.insert(FIELD_IS_DRAW.to_string(), Value::Bool(is_draw));

        self.inner.lock().dedup.record(last, Instant::now());

        if let Err(e) = store.update(&code.game_path(), fields).await {
            warn!("Failed to send move {}: {}", index, e);
            {
                let mut st = self.inner.lock();
                if st.generation == generation {
                    st.session.is_my_turn = true;
                    st.dedup.clear();
                }
            }
            self.inner
                .emit_current(generation, TransportEvent::Error(e.into()));
            return;
        }

        debug!("Sent move {} as {}", index, my_mark);
        self.inner.emit_current(
            generation,
            TransportEvent::Move(MoveEvent {
                index,
                mark: my_mark,
                board: Some(next),
                current_player: Some(current_player),
            }),
        );
    }

    async fn send_reset(&self, starting_mark: Mark) {
        let Some((generation, code, my_mark, store)) = self.inner.live() else {
            return;
        };

        let epoch = {
            let mut st = self.inner.lock();
            st.resetting = true;
            st.reset_epoch += 1;
            st.dedup.clear();
            st.reset_epoch
        };

        let result = async {
            store.remove(&code.game_field(FIELD_LAST_MOVE)).await?;
            let fields = GameSnapshot::fresh_fields(starting_mark)?;
            store.update(&code.game_path(), fields).await
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to reset game: {}", e);
            self.inner.lock().resetting = false;
            self.inner
                .emit_current(generation, TransportEvent::Error(e.into()));
            return;
        }

        {
            let mut st = self.inner.lock();
            if st.generation == generation {
                st.session.is_my_turn = starting_mark == my_mark;
            }
        }
        self.inner
            .emit_current(generation, TransportEvent::Reset { starting_mark });

        // Late winner/draw notifications from the old game are ignored for a moment
        let inner = self.inner.clone();
        let quiet = self.inner.config.reset_suppression();
        tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            let mut st = inner.lock();
            if st.generation == generation && st.reset_epoch == epoch {
                st.resetting = false;
            }
        });
    }

    async fn send_sync(&self, state: &SyncState) {
        let Some((generation, code, _, store)) = self.inner.live() else {
            return;
        };

        let mut fields = Map::new();
        if let Ok(board) = serde_json::to_value(&state.board) {
            fields.insert(FIELD_BOARD.to_string(), board);
        }
        fields.insert(
            FIELD_CURRENT_PLAYER.to_string(),
            state.current_player.to_string().into(),
        );
        fields.insert(
            FIELD_WINNER.to_string(),
            state.winner.map_or(Value::Null, |w| w.to_string().into()),
        );
        fields.insert(FIELD_IS_DRAW.to_string(), Value::Bool(state.is_draw));

        if let Err(e) = store.update(&code.game_path(), fields).await {
            warn!("Failed to sync game: {}", e);
            self.inner
                .emit_current(generation, TransportEvent::Error(e.into()));
        }
    }

    async fn disconnect(&self) {
        if self.inner.teardown().await {
            self.inner.emit(TransportEvent::Disconnected);
        }
    }

    fn session(&self) -> SessionInfo {
        self.inner.lock().session.clone()
    }

    fn set_my_turn(&self, is_my_turn: bool) {
        self.inner.lock().session.is_my_turn = is_my_turn;
    }
}
