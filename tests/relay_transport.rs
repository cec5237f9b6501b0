// Relay play between RelayTransports sharing one in-memory store

use serde_json::json;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use tictactoe_net::config::RelayConfig;
use tictactoe_net::game::{Board, Mark};
use tictactoe_net::network::relay::{
    MemoryClient, MemoryStore, RelayBackend, RelayStore, RoomCode,
};
use tictactoe_net::network::{
    ConnectionStatus, EventReceiver, RelayTransport, Role, Transport, TransportError,
    TransportEvent,
};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

fn transport(store: &MemoryStore) -> (RelayTransport, EventReceiver, MemoryClient) {
    let client = store.client();
    let (transport, rx) =
        RelayTransport::new(RelayBackend::memory(client.clone()), RelayConfig::default());
    (transport, rx, client)
}

async fn expect_event<F>(rx: &mut EventReceiver, mut pred: F) -> TransportEvent
where
    F: FnMut(&TransportEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Assert nothing matching `pred` arrives for a while
async fn expect_no_event<F>(rx: &mut EventReceiver, mut pred: F)
where
    F: FnMut(&TransportEvent) -> bool,
{
    let seen = timeout(QUIET, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    if let Ok(Some(event)) = seen {
        panic!("unexpected event {:?}", event);
    }
}

async fn eventually<F: Fn() -> bool>(cond: F) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

struct Game {
    store: MemoryStore,
    code: RoomCode,
    host: RelayTransport,
    host_rx: EventReceiver,
    joiner: RelayTransport,
    joiner_rx: EventReceiver,
    joiner_conn: MemoryClient,
}

async fn started_game() -> Game {
    let store = MemoryStore::new();
    let (host, mut host_rx, _) = transport(&store);
    let (joiner, mut joiner_rx, joiner_conn) = transport(&store);

    let code = host.create_room().await.unwrap();
    assert_eq!(
        expect_event(&mut host_rx, |e| matches!(e, TransportEvent::RoomCreated { .. })).await,
        TransportEvent::RoomCreated { code: code.clone() }
    );
    assert_eq!(host.session().status, ConnectionStatus::Connecting);

    // Codes are accepted in any case
    joiner
        .join_room(&code.as_str().to_ascii_lowercase())
        .await
        .unwrap();
    expect_event(&mut joiner_rx, |e| {
        matches!(e, TransportEvent::Connected { role: Role::Client })
    })
    .await;
    expect_event(&mut host_rx, |e| {
        matches!(e, TransportEvent::Connected { role: Role::Host })
    })
    .await;

    Game {
        store,
        code,
        host,
        host_rx,
        joiner,
        joiner_rx,
        joiner_conn,
    }
}

/// Host at `host_cell`, then joiner at `joiner_cell`, waiting for each to land
async fn exchange(game: &mut Game, host_cell: usize, joiner_cell: Option<usize>) {
    eventually(|| game.host.is_my_turn()).await;
    let before = game.host.session();
    assert!(before.is_connected());
    game.host.send_move(host_cell, None).await;
    expect_event(&mut game.joiner_rx, |e| {
        matches!(e, TransportEvent::Move(mv) if mv.index == host_cell)
    })
    .await;

    if let Some(cell) = joiner_cell {
        eventually(|| game.joiner.is_my_turn()).await;
        game.joiner.send_move(cell, None).await;
        expect_event(&mut game.host_rx, |e| {
            matches!(e, TransportEvent::Move(mv) if mv.index == cell)
        })
        .await;
    }
}

#[tokio::test]
async fn moves_carry_the_authoritative_board() {
    let mut game = started_game().await;
    assert_eq!(game.host.session().my_mark, Mark::X);
    assert_eq!(game.joiner.session().my_mark, Mark::O);

    eventually(|| game.host.is_my_turn()).await;
    assert!(!game.joiner.is_my_turn());

    // Joiner can't move out of turn
    game.joiner.send_move(4, None).await;
    assert_eq!(game.store.read(&format!("games/{}/lastMove", game.code)), None);

    game.host.send_move(0, Some(&Board::network())).await;
    assert!(!game.host.is_my_turn());

    let event = expect_event(&mut game.joiner_rx, |e| matches!(e, TransportEvent::Move(_))).await;
    let TransportEvent::Move(mv) = event else {
        unreachable!()
    };
    assert_eq!((mv.index, mv.mark), (0, Mark::X));
    assert_eq!(mv.board.as_ref().and_then(|b| b.get(0)), Some(Mark::X));
    assert_eq!(mv.current_player, Some(Mark::O));

    eventually(|| game.joiner.is_my_turn()).await;
    game.joiner.send_move(4, None).await;
    let event = expect_event(&mut game.host_rx, |e| {
        matches!(e, TransportEvent::Move(mv) if mv.mark == Mark::O)
    })
    .await;
    let TransportEvent::Move(mv) = event else {
        unreachable!()
    };
    let board = mv.board.unwrap();
    assert_eq!(board.get(0), Some(Mark::X));
    assert_eq!(board.get(4), Some(Mark::O));
    eventually(|| game.host.is_my_turn()).await;
}

#[tokio::test]
async fn redelivered_move_is_processed_once() {
    let mut game = started_game().await;
    exchange(&mut game, 0, None).await;

    game.store
        .redeliver(&format!("games/{}/lastMove", game.code));
    expect_no_event(&mut game.joiner_rx, |e| matches!(e, TransportEvent::Move(_))).await;

    // The host never sees its own move echoed back
    expect_no_event(&mut game.host_rx, |e| {
        matches!(e, TransportEvent::Move(mv) if mv.mark == Mark::X)
    })
    .await;
}

#[tokio::test]
async fn win_reaches_both_sides_and_reset_clears_it() {
    let mut game = started_game().await;
    exchange(&mut game, 0, Some(3)).await;
    exchange(&mut game, 1, Some(4)).await;
    exchange(&mut game, 2, None).await;

    expect_event(&mut game.joiner_rx, |e| {
        matches!(e, TransportEvent::Sync(s) if !s.provisional && s.winner == Some(Mark::X))
    })
    .await;
    let snapshot = game.store.read(&format!("games/{}", game.code)).unwrap();
    assert_eq!(snapshot["winner"], json!("X"));

    game.host.send_reset(Mark::X).await;
    expect_event(&mut game.host_rx, |e| {
        matches!(e, TransportEvent::Reset { starting_mark: Mark::X })
    })
    .await;

    expect_event(&mut game.joiner_rx, |e| {
        matches!(e, TransportEvent::Sync(s) if !s.provisional && s.board == Board::network())
    })
    .await;
    expect_no_event(&mut game.joiner_rx, |e| {
        matches!(e, TransportEvent::Sync(s) if s.winner.is_some())
    })
    .await;

    let snapshot = game.store.read(&format!("games/{}", game.code)).unwrap();
    assert!(snapshot.get("winner").is_none());
    assert!(snapshot.get("lastMove").is_none());
    assert!(game.host.is_my_turn());
}

#[tokio::test]
async fn room_refuses_a_second_joiner() {
    let game = started_game().await;
    let (late, mut late_rx, _) = transport(&game.store);

    assert_eq!(
        late.join_room(game.code.as_str()).await,
        Err(TransportError::RoomFull)
    );
    assert_eq!(
        expect_event(&mut late_rx, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::RoomFull)
    );
    assert_eq!(late.session().status, ConnectionStatus::Error);

    // The failed attempt must not release the real joiner's claim
    let room = game.store.read(&game.code.room_path()).unwrap();
    assert_eq!(room["player2"], json!(true));
}

#[tokio::test]
async fn simultaneous_joins_have_one_winner() {
    let store = MemoryStore::new();
    let (host, _host_rx, _) = transport(&store);
    let (a, _a_rx, _) = transport(&store);
    let (b, _b_rx, _) = transport(&store);

    let code = host.create_room().await.unwrap();
    let (ra, rb) = tokio::join!(a.join_room(code.as_str()), b.join_room(code.as_str()));

    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(ra == Err(TransportError::RoomFull) || rb == Err(TransportError::RoomFull));
}

#[tokio::test]
async fn bad_codes_are_told_apart() {
    let store = MemoryStore::new();
    let (host, _host_rx, _) = transport(&store);
    let (joiner, _joiner_rx, _) = transport(&store);

    assert_eq!(
        joiner.join_room("ZZZZZZ").await,
        Err(TransportError::RoomNotFound)
    );
    assert!(matches!(
        joiner.join_room("abc").await,
        Err(TransportError::InvalidRoomCode(_))
    ));

    let code = host.create_room().await.unwrap();
    assert_eq!(
        host.join_room(code.as_str()).await,
        Err(TransportError::OwnRoom)
    );
    // Refusing the request leaves the room alone
    assert_eq!(host.room_code(), Some(code));
}

#[tokio::test]
async fn host_leaving_closes_the_room() {
    let mut game = started_game().await;

    game.host.disconnect().await;
    expect_event(&mut game.host_rx, |e| matches!(e, TransportEvent::Disconnected)).await;
    assert_eq!(game.store.read(&game.code.room_path()), None);
    assert_eq!(game.store.read(&game.code.game_path()), None);

    assert_eq!(
        expect_event(&mut game.joiner_rx, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::RoomClosed)
    );
    expect_event(&mut game.joiner_rx, |e| matches!(e, TransportEvent::Disconnected)).await;
    assert_eq!(game.joiner.session().status, ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn joiner_dropping_reopens_the_room() {
    let mut game = started_game().await;

    game.joiner_conn.drop_connection();
    expect_event(&mut game.host_rx, |e| matches!(e, TransportEvent::PeerLeft)).await;
    assert_eq!(game.host.session().status, ConnectionStatus::Connecting);

    let room = game.store.read(&game.code.room_path()).unwrap();
    assert_eq!(room["player2"], json!(false));

    // Someone else can take the seat
    let (next, mut next_rx, _) = transport(&game.store);
    next.join_room(game.code.as_str()).await.unwrap();
    expect_event(&mut next_rx, |e| matches!(e, TransportEvent::Connected { .. })).await;
    expect_event(&mut game.host_rx, |e| {
        matches!(e, TransportEvent::Connected { role: Role::Host })
    })
    .await;
}

#[tokio::test]
async fn joiner_leaving_gracefully_releases_the_seat() {
    let mut game = started_game().await;

    game.joiner.disconnect().await;
    expect_event(&mut game.joiner_rx, |e| matches!(e, TransportEvent::Disconnected)).await;
    expect_event(&mut game.host_rx, |e| matches!(e, TransportEvent::PeerLeft)).await;

    // The room itself belongs to the host and stays
    assert!(game.store.read(&game.code.room_path()).is_some());
}

#[tokio::test]
async fn host_connection_drop_deletes_the_room() {
    let store = MemoryStore::new();
    let (host, _host_rx, host_conn) = transport(&store);
    let code = host.create_room().await.unwrap();
    assert!(store.read(&code.room_path()).is_some());

    host_conn.drop_connection();
    assert_eq!(store.read(&code.room_path()), None);
    assert_eq!(store.read(&code.game_path()), None);
}

#[tokio::test]
async fn unavailable_backend_is_reported_up_front() {
    let (relay, mut rx) = RelayTransport::new(
        RelayBackend::Unavailable {
            reason: "no relay server configured".into(),
        },
        RelayConfig::default(),
    );
    assert!(!relay.is_available());
    assert_eq!(relay.unavailable_reason(), Some("no relay server configured"));

    let err = relay.create_room().await.unwrap_err();
    assert!(matches!(err, TransportError::RelayUnavailable(_)));
    assert_eq!(
        expect_event(&mut rx, |_| true).await,
        TransportEvent::Error(err)
    );

    // Never connected, so nothing to announce
    relay.disconnect().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unclaimed_room_times_out() {
    let store = MemoryStore::new();
    let (host, mut host_rx) = RelayTransport::new(
        RelayBackend::memory(store.client()),
        RelayConfig {
            claim_timeout_secs: 1,
            ..RelayConfig::default()
        },
    );

    let code = host.create_room().await.unwrap();
    assert_eq!(
        expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::HostTimedOut { secs: 1 })
    );
    assert_eq!(host.session().status, ConnectionStatus::Error);
    assert_eq!(store.read(&code.room_path()), None);
}

#[tokio::test]
async fn connected_players_must_leave_before_starting_over() {
    let mut game = started_game().await;
    exchange(&mut game, 0, Some(4)).await;

    assert_eq!(
        game.host.create_room().await,
        Err(TransportError::AlreadyConnected)
    );
    assert_eq!(
        expect_event(&mut game.host_rx, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::AlreadyConnected)
    );
    assert_eq!(game.host.session().status, ConnectionStatus::Connected);
    assert_eq!(game.host.room_code(), Some(game.code.clone()));

    let (other_host, _other_rx, _) = transport(&game.store);
    let other = other_host.create_room().await.unwrap();
    assert_eq!(
        game.joiner.join_room(other.as_str()).await,
        Err(TransportError::AlreadyConnected)
    );
    assert_eq!(
        game.joiner.join_room(game.code.as_str()).await,
        Err(TransportError::AlreadyInRoom)
    );
    assert_eq!(game.joiner.session().status, ConnectionStatus::Connected);

    // The game in progress is untouched
    let board = &game.store.read(&game.code.game_path()).unwrap()["board"];
    assert_eq!(board[0], json!("X"));
    assert_eq!(board[4], json!("O"));
}

#[tokio::test]
async fn waiting_host_can_replace_its_room() {
    let store = MemoryStore::new();
    let (host, _host_rx, _) = transport(&store);

    let first = host.create_room().await.unwrap();
    let second = host.create_room().await.unwrap();
    assert_eq!(host.room_code(), Some(second.clone()));
    assert_eq!(host.session().status, ConnectionStatus::Connecting);
    assert!(store.read(&second.room_path()).is_some());
    if first != second {
        assert_eq!(store.read(&first.room_path()), None);
    }
}

#[tokio::test]
async fn stale_result_is_ignored_right_after_a_reset() {
    let mut game = started_game().await;
    exchange(&mut game, 0, Some(4)).await;

    game.host.send_reset(Mark::X).await;
    expect_event(&mut game.host_rx, |e| {
        matches!(e, TransportEvent::Sync(s) if !s.provisional && s.board == Board::network())
    })
    .await;

    // A result from the old game lands inside the quiet period
    let winner = game.code.game_field("winner");
    let writer = game.store.client();
    writer.set(&winner, json!("O")).await.unwrap();
    expect_no_event(&mut game.host_rx, |e| {
        matches!(e, TransportEvent::Sync(s) if s.winner.is_some())
    })
    .await;

    // Once it is over, result changes are reported again
    sleep(Duration::from_millis(500)).await;
    game.store.redeliver(&winner);
    expect_event(&mut game.host_rx, |e| {
        matches!(e, TransportEvent::Sync(s) if s.winner == Some(Mark::O))
    })
    .await;
}

#[tokio::test]
async fn losing_the_store_connection_ends_the_session() {
    let mut game = started_game().await;

    game.joiner_conn.drop_connection();
    assert!(matches!(
        expect_event(&mut game.joiner_rx, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::ConnectionLost(_))
    ));
    expect_event(&mut game.joiner_rx, |e| matches!(e, TransportEvent::Disconnected)).await;
    assert_eq!(game.joiner.session().status, ConnectionStatus::Error);
    assert!(!game.joiner.is_my_turn());

    // The host only sees its opponent leave
    expect_event(&mut game.host_rx, |e| matches!(e, TransportEvent::PeerLeft)).await;
    assert_eq!(game.host.session().status, ConnectionStatus::Connecting);
}
