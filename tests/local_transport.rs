// LAN play between two LocalTransports over loopback TCP

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use tictactoe_net::config::LocalConfig;
use tictactoe_net::game::{Board, Mark};
use tictactoe_net::network::{
    ConnectionStatus, EventReceiver, LocalTransport, MoveEvent, Role, SyncState, Transport,
    TransportError, TransportEvent,
};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> LocalConfig {
    LocalConfig {
        keepalive_interval_ms: 0,
        ..LocalConfig::default()
    }
}

/// Next event matching `pred`, skipping the rest
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

async fn connected_pair() -> (LocalTransport, EventReceiver, LocalTransport, EventReceiver) {
    let (host, mut host_rx) = LocalTransport::new(config(), true);
    let (client, mut client_rx) = LocalTransport::new(config(), true);

    let port = host.start_hosting(0).await.unwrap();
    assert_eq!(
        expect_event(&mut host_rx, |_| true).await,
        TransportEvent::Hosting { port }
    );

    client.join_game("127.0.0.1", port).await.unwrap();
    expect_event(&mut client_rx, |e| {
        matches!(e, TransportEvent::Connected { role: Role::Client })
    })
    .await;
    expect_event(&mut host_rx, |e| {
        matches!(e, TransportEvent::Connected { role: Role::Host })
    })
    .await;

    (host, host_rx, client, client_rx)
}

#[tokio::test]
async fn host_and_client_take_turns() {
    let (host, mut host_rx, client, mut client_rx) = connected_pair().await;

    assert_eq!(host.session().my_mark, Mark::X);
    assert_eq!(client.session().my_mark, Mark::O);
    assert!(host.is_my_turn());
    assert!(!client.is_my_turn());

    // Out of turn: silently dropped
    client.send_move(4, None).await;

    host.send_move(0, None).await;
    assert!(!host.is_my_turn());
    let event = expect_event(&mut client_rx, |e| matches!(e, TransportEvent::Move(_))).await;
    assert_eq!(event, TransportEvent::Move(MoveEvent::bare(0, Mark::X)));
    assert!(client.is_my_turn());

    client.send_move(4, None).await;
    let event = expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Move(_))).await;
    assert_eq!(event, TransportEvent::Move(MoveEvent::bare(4, Mark::O)));
    assert!(host.is_my_turn());
    assert!(!client.is_my_turn());
}

#[tokio::test]
async fn reset_and_sync_reach_the_peer() {
    let (host, _host_rx, client, mut client_rx) = connected_pair().await;

    host.send_reset(Mark::O).await;
    assert_eq!(
        expect_event(&mut client_rx, |e| matches!(e, TransportEvent::Reset { .. })).await,
        TransportEvent::Reset {
            starting_mark: Mark::O
        }
    );
    assert!(client.is_my_turn());
    assert!(!host.is_my_turn());

    let mut board = Board::network();
    board.place(0, Mark::X);
    board.place(1, Mark::X);
    board.place(2, Mark::X);
    let state = SyncState {
        board: board.clone(),
        current_player: Mark::O,
        winner: Some(Mark::X),
        is_draw: false,
        provisional: false,
    };
    host.send_sync(&state).await;

    let event = expect_event(&mut client_rx, |e| matches!(e, TransportEvent::Sync(_))).await;
    assert_eq!(event, TransportEvent::Sync(state));
    // Nobody moves after a win
    assert!(!client.is_my_turn());
}

#[tokio::test]
async fn disconnect_reaches_both_sides() {
    let (host, mut host_rx, client, mut client_rx) = connected_pair().await;

    host.disconnect().await;
    expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Disconnected)).await;
    expect_event(&mut client_rx, |e| matches!(e, TransportEvent::Disconnected)).await;

    assert_eq!(host.session().status, ConnectionStatus::Disconnected);
    assert_eq!(client.session().status, ConnectionStatus::Disconnected);

    // Idempotent, and silent the second time
    host.disconnect().await;
    assert!(host_rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_and_unknown_lines_are_dropped() {
    let (host, mut host_rx) = LocalTransport::new(config(), true);
    let port = host.start_hosting(0).await.unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Connected { .. })).await;

    host.send_move(0, None).await;
    peer.write_all(b"this is not json\n").await.unwrap();
    peer.write_all(b"{\"type\":\"chat\",\"text\":\"hi\"}\n").await.unwrap();
    peer.write_all(b"{\"type\":\"move\",\"data\":{\"index\":4,\"mark\":\"O\"}}\n")
        .await
        .unwrap();

    let event = expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Move(_))).await;
    assert_eq!(event, TransportEvent::Move(MoveEvent::bare(4, Mark::O)));
    assert!(host.session().is_connected());
}

#[tokio::test]
async fn ping_is_answered_with_matching_pong() {
    let (host, mut host_rx) = LocalTransport::new(config(), true);
    let port = host.start_hosting(0).await.unwrap();

    let peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Connected { .. })).await;

    let (read_half, mut write_half) = peer.into_split();
    write_half
        .write_all(b"{\"type\":\"ping\",\"timestampMs\":1234}\n")
        .await
        .unwrap();

    let mut lines = BufReader::new(read_half).lines();
    let line = timeout(WAIT, lines.next_line())
        .await
        .expect("timed out waiting for pong")
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["type"], "pong");
    assert_eq!(reply["timestampMs"], 1234);
}

#[tokio::test]
async fn client_timeout_surfaces_as_error() {
    let (client, mut client_rx) = LocalTransport::new(
        LocalConfig {
            connect_timeout_secs: 1,
            ..config()
        },
        true,
    );

    // Non-routable address: the dial hangs until the timeout
    let result = client.join_game("10.255.255.1", 8888).await;
    assert!(result.is_err());
    expect_event(&mut client_rx, |e| matches!(e, TransportEvent::Error(_))).await;
    assert_eq!(client.session().status, ConnectionStatus::Error);
}

#[tokio::test]
async fn endless_line_drops_the_peer() {
    let (host, mut host_rx) = LocalTransport::new(config(), true);
    let port = host.start_hosting(0).await.unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Connected { .. })).await;

    // No newline ever arrives; the host hangs up instead of buffering forever
    tokio::spawn(async move {
        let _ = peer.write_all(&vec![b'a'; 80 * 1024]).await;
        let _ = peer.flush().await;
        tokio::time::sleep(WAIT).await;
    });

    assert!(matches!(
        expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Error(_))).await,
        TransportEvent::Error(TransportError::ConnectionLost(_))
    ));
    expect_event(&mut host_rx, |e| matches!(e, TransportEvent::Disconnected)).await;
    assert!(!host.session().is_connected());
}
