// LAN transport: one side listens on a TCP port, the other dials it directly
// Messages are newline-delimited JSON (see protocol.rs)

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::error::TransportError;
use super::events::{
    ConnectionStatus, EventReceiver, EventSender, MoveEvent, Role, SessionInfo, SyncState,
    TransportEvent,
};
use super::protocol::{MovePayload, WireMessage};
use super::Transport;
use crate::config::LocalConfig;
use crate::game::{Board, Mark, NETWORK_CELLS};

/// Longest line a peer may send before we hang up
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Peer-to-peer transport over a single TCP connection
pub struct LocalTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: LocalConfig,
    tcp_available: bool,
    events: EventSender,
    state: Mutex<LocalState>,
}

#[derive(Default)]
struct LocalState {
    session: SessionInfo,
    /// Bumped on every teardown; tasks from an older session go quiet
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WireMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalState {
    /// Close sockets and forget the session. Returns the aborted tasks so
    /// async callers can wait for the sockets to actually drop.
    fn teardown(&mut self) -> Vec<JoinHandle<()>> {
        self.generation += 1;
        self.outbound = None;
        self.session.clear();
        let tasks: Vec<_> = self.tasks.drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        tasks
    }
}

impl LocalTransport {
    /// Create a transport and the receiver its events arrive on.
    /// `tcp_available` comes from the startup capability probe.
    pub fn new(config: LocalConfig, tcp_available: bool) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            tcp_available,
            events,
            state: Mutex::new(LocalState::default()),
        });
        (Self { inner }, rx)
    }

    pub fn default_port(&self) -> u16 {
        self.inner.config.default_port
    }

    /// Listen on `port` across all interfaces and wait for one opponent.
    ///
    /// Returns the bound port (useful when `port` is 0). Emits `Hosting`
    /// once bound and `Connected { role: Host }` when the peer arrives.
    pub async fn start_hosting(&self, port: u16) -> Result<u16, TransportError> {
        self.reset_session().await;

        let generation = self.inner.begin(Role::Host, None, port);
        if !self.inner.tcp_available {
            return self.inner.fail(generation, TransportError::TcpUnavailable);
        }

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind port {}: {}", port, e);
                return self.inner.fail(generation, TransportError::from_bind(port, &e));
            }
        };
        let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
        info!("Hosting on port {}", bound);

        let inner = self.inner.clone();
        let wait = self.inner.config.host_wait_timeout();
        let mut st = self.inner.lock();
        if st.generation != generation {
            // Disconnected while binding
            return Ok(bound);
        }
        st.session.port = Some(bound);
        self.inner.emit(TransportEvent::Hosting { port: bound });
        st.tasks
            .push(tokio::spawn(inner.accept_loop(generation, listener, wait)));

        Ok(bound)
    }

    /// Dial a host. Emits `Connected { role: Client }` on success.
    pub async fn join_game(&self, address: &str, port: u16) -> Result<(), TransportError> {
        self.reset_session().await;

        let target = format!("{}:{}", address, port);
        let generation = self.inner.begin(Role::Client, Some(target.clone()), port);
        if !self.inner.tcp_available {
            return self.inner.fail(generation, TransportError::TcpUnavailable);
        }

        info!("Connecting to {}", target);
        let connect = TcpStream::connect((address, port));
        let stream = match tokio::time::timeout(self.inner.config.connect_timeout(), connect).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("Connection to {} failed: {}", target, e);
                return self.inner.fail(
                    generation,
                    TransportError::ConnectFailed {
                        address: target,
                        reason: e.to_string(),
                    },
                );
            }
            Err(_) => {
                return self
                    .inner
                    .fail(generation, TransportError::ConnectTimedOut { address: target });
            }
        };

        self.inner.attach_peer(generation, stream, Role::Client, None);
        Ok(())
    }

    /// Send a liveness probe right away (keepalive pings also run on a timer)
    pub fn send_ping(&self) {
        let st = self.inner.lock();
        if st.session.is_connected() {
            send(&st, WireMessage::Ping {
                timestamp_ms: now_ms(),
            });
        }
    }

    async fn reset_session(&self) {
        let tasks = self.inner.lock().teardown();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, LocalState> {
        // State stays consistent even if a holder panicked; every write is a plain assignment
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn begin(&self, role: Role, remote: Option<String>, port: u16) -> u64 {
        let mut st = self.lock();
        st.session.begin(role);
        st.session.remote_address = remote;
        st.session.port = Some(port);
        st.generation
    }

    /// Mark the session failed and report `err`
    fn fail<T>(&self, generation: u64, err: TransportError) -> Result<T, TransportError> {
        self.fail_session(generation, err.clone());
        Err(err)
    }

    fn fail_session(&self, generation: u64, err: TransportError) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        st.teardown();
        st.session.status = ConnectionStatus::Error;
        warn!("LAN session failed: {}", err);
        self.emit(TransportEvent::Error(err));
    }

    async fn accept_loop(
        self: Arc<Self>,
        generation: u64,
        listener: TcpListener,
        wait: Option<Duration>,
    ) {
        let accepted = match wait {
            Some(limit) => match tokio::time::timeout(limit, listener.accept()).await {
                Ok(result) => result,
                Err(_) => {
                    self.fail_session(
                        generation,
                        TransportError::HostTimedOut {
                            secs: limit.as_secs(),
                        },
                    );
                    return;
                }
            },
            None => listener.accept().await,
        };

        match accepted {
            Ok((stream, addr)) => {
                info!("Peer connected from {}", addr);
                self.attach_peer(generation, stream, Role::Host, Some(addr));
            }
            Err(e) => {
                self.fail_session(generation, TransportError::ConnectionLost(e.to_string()));
                return;
            }
        }

        // Two players only: refuse anyone else while the game runs
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    warn!("Refusing extra peer {}; a game is already in progress", addr);
                    drop(stream);
                }
                Err(e) => {
                    debug!("Listener stopped accepting: {}", e);
                    break;
                }
            }
        }
    }

    fn attach_peer(
        self: &Arc<Self>,
        generation: u64,
        stream: TcpStream,
        role: Role,
        peer_addr: Option<SocketAddr>,
    ) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut st = self.lock();
        if st.generation != generation {
            debug!("Dropping connection for a session that was torn down");
            return;
        }
        st.outbound = Some(tx);
        st.session.status = ConnectionStatus::Connected;
        if let Some(addr) = peer_addr {
            st.session.remote_address = Some(addr.to_string());
        }
        self.emit(TransportEvent::Connected { role });

        let keepalive = self.config.keepalive_interval();
        st.tasks.push(tokio::spawn(
            self.clone().write_loop(generation, write_half, rx, keepalive),
        ));
        st.tasks
            .push(tokio::spawn(self.clone().read_loop(generation, read_half)));
    }

    async fn write_loop(
        self: Arc<Self>,
        generation: u64,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<WireMessage>,
        keepalive: Option<Duration>,
    ) {
        let mut ticker = keepalive.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = next_tick(&mut ticker) => WireMessage::Ping { timestamp_ms: now_ms() },
            };

            let line = match msg.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to encode {:?}: {}", msg, e);
                    continue;
                }
            };
            debug!("-> {}", line.trim_end());

            if let Err(e) = writer.write_all(line.as_bytes()).await {
                self.on_peer_lost(generation, Some(e.to_string()));
                return;
            }
        }

        let _ = writer.shutdown().await;
    }

    async fn read_loop(self: Arc<Self>, generation: u64, reader: OwnedReadHalf) {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let limit = MAX_LINE_BYTES as u64 + 1;
            match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    info!("Peer closed the connection");
                    self.on_peer_lost(generation, None);
                    return;
                }
                Ok(_) if buf.len() > MAX_LINE_BYTES && !buf.ends_with(b"\n") => {
                    warn!("Peer sent a line over {} bytes", MAX_LINE_BYTES);
                    self.on_peer_lost(generation, Some("message too long".to_string()));
                    return;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!("<- {}", line.trim_end());
                    match WireMessage::from_line(&line) {
                        Ok(msg) => self.handle_message(generation, msg),
                        Err(e) => warn!("Dropping malformed message: {}", e),
                    }
                }
                Err(e) => {
                    self.on_peer_lost(generation, Some(e.to_string()));
                    return;
                }
            }
        }
    }

    fn handle_message(&self, generation: u64, msg: WireMessage) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        let my_mark = st.session.my_mark;

        match msg {
            WireMessage::Move { data } => {
                if data.index >= NETWORK_CELLS || data.mark == my_mark {
                    warn!("Ignoring invalid move {:?}", data);
                    return;
                }
                st.session.is_my_turn = true;
                self.emit(TransportEvent::Move(MoveEvent::bare(data.index, data.mark)));
            }
            WireMessage::Reset { starting_mark } => {
                st.session.is_my_turn = starting_mark == my_mark;
                self.emit(TransportEvent::Reset { starting_mark });
            }
            WireMessage::Sync {
                board,
                current_player,
                winner,
                is_draw,
            } => {
                st.session.is_my_turn = current_player == my_mark && winner.is_none() && !is_draw;
                self.emit(TransportEvent::Sync(SyncState {
                    board: Board::normalized(board.cells().to_vec()),
                    current_player,
                    winner,
                    is_draw,
                    provisional: false,
                }));
            }
            WireMessage::Ping { timestamp_ms } => {
                send(&st, WireMessage::Pong { timestamp_ms });
            }
            WireMessage::Pong { timestamp_ms } => {
                debug!("RTT {} ms", now_ms().saturating_sub(timestamp_ms));
            }
            WireMessage::Unknown => {
                debug!("Ignoring message of unknown type");
            }
        }
    }

    fn on_peer_lost(&self, generation: u64, reason: Option<String>) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        st.teardown();
        drop(st);

        if let Some(reason) = reason {
            warn!("Connection error: {}", reason);
            self.emit(TransportEvent::Error(TransportError::ConnectionLost(reason)));
        }
        self.emit(TransportEvent::Disconnected);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_move(&self, index: usize, _board: Option<&Board>) {
        let mut st = self.inner.lock();
        if !st.session.is_connected() || !st.session.is_my_turn {
            debug!("Not sending move {}: not our turn", index);
            return;
        }
        if index >= NETWORK_CELLS {
            return;
        }
        let mark = st.session.my_mark;
        send(&st, WireMessage::Move {
            data: MovePayload { index, mark },
        });
        st.session.is_my_turn = false;
    }

    async fn send_reset(&self, starting_mark: Mark) {
        let mut st = self.inner.lock();
        if !st.session.is_connected() {
            return;
        }
        send(&st, WireMessage::Reset { starting_mark });
        st.session.is_my_turn = starting_mark == st.session.my_mark;
    }

    async fn send_sync(&self, state: &SyncState) {
        let mut st = self.inner.lock();
        if !st.session.is_connected() {
            return;
        }
        send(&st, WireMessage::Sync {
            board: state.board.clone(),
            current_player: state.current_player,
            winner: state.winner,
            is_draw: state.is_draw,
        });
        st.session.is_my_turn =
            state.current_player == st.session.my_mark && state.winner.is_none() && !state.is_draw;
    }

    async fn disconnect(&self) {
        let (was_connected, tasks) = {
            let mut st = self.inner.lock();
            let was_connected = st.session.is_connected();
            (was_connected, st.teardown())
        };
        for task in tasks {
            let _ = task.await;
        }
        if was_connected {
            info!("Disconnected");
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

fn send(st: &LocalState, msg: WireMessage) {
    if let Some(outbound) = &st.outbound {
        let _ = outbound.send(msg);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LocalConfig {
        LocalConfig {
            keepalive_interval_ms: 0,
            ..LocalConfig::default()
        }
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected_is_silent() {
        let (transport, mut rx) = LocalTransport::new(config(), true);
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.session().status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_sends_are_noops_when_not_connected() {
        let (transport, mut rx) = LocalTransport::new(config(), true);
        transport.send_move(4, None).await;
        transport.send_reset(Mark::X).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_tcp_capability_is_typed() {
        let (transport, mut rx) = LocalTransport::new(config(), false);
        let result = transport.start_hosting(0).await;
        assert_eq!(result, Err(TransportError::TcpUnavailable));
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Error(TransportError::TcpUnavailable))
        );
        assert_eq!(transport.session().status, ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_port_in_use_is_reported() {
        let blocker = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let (transport, mut rx) = LocalTransport::new(config(), true);
        let result = transport.start_hosting(port).await;
        assert_eq!(result, Err(TransportError::PortInUse { port }));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Error(TransportError::PortInUse { .. }))
        ));
    }

    #[tokio::test]
    async fn test_join_refused() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let (transport, mut rx) = LocalTransport::new(config(), true);
        let result = transport.join_game("127.0.0.1", port).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Error(TransportError::ConnectFailed { .. }))
        ));
    }
}
