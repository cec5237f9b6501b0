// Relay server
// Serves a MemoryStore over WebSocket. Each socket is one store connection:
// when it closes, its watches end and its on-disconnect directives run.

use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::memory::{MemoryClient, MemoryStore};
use super::store::{RelayStore, StoreError, WatchId};
use super::wire::{Frame, Op, Request};

type Outbound = mpsc::UnboundedSender<Message>;

/// Client-chosen watch id -> (store watch id, forwarding task)
type Forwards = HashMap<WatchId, (WatchId, JoinHandle<()>)>;

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, store: MemoryStore) -> std::io::Result<()> {
    info!("Relay server listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        tokio::spawn(handle_connection(stream, addr, store.clone()));
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, store: MemoryStore) {
    info!("New connection from {}", addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed: {}", e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let client = store.client();
    let mut forwards = Forwards::new();

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Connection from {} failed: {}", addr, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<Request>(&text) {
                Ok(req) => {
                    let frame = handle_request(&client, req, &tx, &mut forwards).await;
                    send_frame(&tx, &frame);
                }
                Err(e) => {
                    warn!("Failed to parse request from {}: {}", addr, e);
                    send_frame(
                        &tx,
                        &Frame::Failed {
                            id: 0,
                            message: format!("Invalid request format: {}", e),
                        },
                    );
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    for (_, (_, task)) in forwards.drain() {
        task.abort();
    }
    client.drop_connection();
    info!("Connection from {} closed", addr);

    send_task.abort();
}

async fn handle_request(
    client: &MemoryClient,
    req: Request,
    tx: &Outbound,
    forwards: &mut Forwards,
) -> Frame {
    let id = req.id;
    debug!("Request {}: {:?}", id, req.request);

    let result: Result<Frame, StoreError> = match req.request {
        Op::Get { path } => client.get(&path).await.map(|value| Frame::value(id, value)),
        Op::Set { path, value } => client.set(&path, value).await.map(|_| Frame::ok(id)),
        Op::Update { path, fields } => client.update(&path, fields).await.map(|_| Frame::ok(id)),
        Op::Remove { path } => client.remove(&path).await.map(|_| Frame::ok(id)),
        Op::CompareAndSet {
            path,
            expected,
            value,
        } => client
            .compare_and_set(&path, expected, value)
            .await
            .map(|outcome| Frame::Reply {
                id,
                value: outcome.current,
                committed: Some(outcome.committed),
            }),
        Op::Watch { path, watch_id } => match client.watch(&path).await {
            Ok(watch) => {
                let tx = tx.clone();
                let mut changes = watch.changes;
                let task = tokio::spawn(async move {
                    while let Some(value) = changes.recv().await {
                        send_frame(&tx, &Frame::Change { watch_id, value });
                    }
                });
                if let Some((old, old_task)) = forwards.insert(watch_id, (watch.id, task)) {
                    old_task.abort();
                    let _ = client.unwatch(old).await;
                }
                Ok(Frame::ok(id))
            }
            Err(e) => Err(e),
        },
        Op::Unwatch { watch_id } => {
            if let Some((store_id, task)) = forwards.remove(&watch_id) {
                task.abort();
                client.unwatch(store_id).await.map(|_| Frame::ok(id))
            } else {
                Ok(Frame::ok(id))
            }
        }
        Op::OnDisconnect { path, action } => client
            .on_disconnect(&path, action)
            .await
            .map(|_| Frame::ok(id)),
        Op::CancelOnDisconnect { path } => client
            .cancel_on_disconnect(&path)
            .await
            .map(|_| Frame::ok(id)),
    };

    result.unwrap_or_else(|e| Frame::Failed {
        id,
        message: e.to_string(),
    })
}

fn send_frame(tx: &Outbound, frame: &Frame) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json));
        }
        Err(e) => error!("Failed to encode frame: {}", e),
    }
}
