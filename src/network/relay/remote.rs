// RelayStore over a WebSocket connection to the relay server

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::store::{CasOutcome, DisconnectAction, RelayStore, StoreError, Watch, WatchId};
use super::wire::{Frame, Op, Request};

struct Reply {
    value: Option<Value>,
    committed: Option<bool>,
}

type Pending = HashMap<u64, oneshot::Sender<Result<Reply, StoreError>>>;

/// One connection to a relay server. Dropping it closes the socket, which
/// makes the server run this connection's on-disconnect directives.
pub struct WsStore {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<Pending>,
    watches: Mutex<HashMap<WatchId, mpsc::UnboundedSender<Option<Value>>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl WsStore {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| StoreError::Unavailable(format!("timed out reaching {}", url)))?
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", url, e)))?;

        info!("Connected to relay server at {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let send_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reader = shared.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => reader.dispatch(frame),
                        Err(e) => warn!("Failed to parse relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay connection failed: {}", e);
                        break;
                    }
                }
            }
            reader.shut_down();
        });

        Ok(Self {
            shared,
            tasks: vec![send_task, recv_task],
        })
    }

    /// Drop the socket now, as if the network went away
    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.shut_down();
    }

    async fn request(&self, op: Op) -> Result<Reply, StoreError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let text = serde_json::to_string(&Request { id, request: op })
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);

        if self.shared.outbound.send(Message::Text(text)).is_err() {
            self.shared.pending().remove(&id);
            return Err(StoreError::ConnectionClosed);
        }

        rx.await.map_err(|_| StoreError::ConnectionClosed)?
    }
}

impl Drop for WsStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn watches(&self) -> MutexGuard<'_, HashMap<WatchId, mpsc::UnboundedSender<Option<Value>>>> {
        self.watches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Reply {
                id,
                value,
                committed,
            } => {
                if let Some(waiter) = self.pending().remove(&id) {
                    let _ = waiter.send(Ok(Reply { value, committed }));
                }
            }
            Frame::Failed { id, message } => match self.pending().remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(Err(StoreError::Remote(message)));
                }
                None => warn!("Relay server error: {}", message),
            },
            Frame::Change { watch_id, value } => {
                if let Some(tx) = self.watches().get(&watch_id) {
                    let _ = tx.send(value);
                } else {
                    debug!("Change for unknown watch {}", watch_id);
                }
            }
        }
    }

    /// Fail every waiter and close every watch
    fn shut_down(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Relay connection closed");
        for (_, waiter) in self.pending().drain() {
            let _ = waiter.send(Err(StoreError::ConnectionClosed));
        }
        self.watches().clear();
    }
}

#[async_trait]
impl RelayStore for WsStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let reply = self.request(Op::Get { path: path.to_string() }).await?;
        Ok(reply.value)
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.request(Op::Set {
            path: path.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        self.request(Op::Update {
            path: path.to_string(),
            fields,
        })
        .await
        .map(|_| ())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.request(Op::Remove { path: path.to_string() })
            .await
            .map(|_| ())
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Value>,
        value: Option<Value>,
    ) -> Result<CasOutcome, StoreError> {
        let reply = self
            .request(Op::CompareAndSet {
                path: path.to_string(),
                expected,
                value,
            })
            .await?;
        Ok(CasOutcome {
            committed: reply.committed.unwrap_or(false),
            current: reply.value,
        })
    }

    async fn watch(&self, path: &str) -> Result<Watch, StoreError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, changes) = mpsc::unbounded_channel();
        // Register before asking so the first value can't be missed
        self.shared.watches().insert(id, tx);

        let result = self
            .request(Op::Watch {
                path: path.to_string(),
                watch_id: id,
            })
            .await;
        if let Err(e) = result {
            self.shared.watches().remove(&id);
            return Err(e);
        }

        Ok(Watch { id, changes })
    }

    async fn unwatch(&self, id: WatchId) -> Result<(), StoreError> {
        self.shared.watches().remove(&id);
        self.request(Op::Unwatch { watch_id: id }).await.map(|_| ())
    }

    async fn on_disconnect(&self, path: &str, action: DisconnectAction) -> Result<(), StoreError> {
        self.request(Op::OnDisconnect {
            path: path.to_string(),
            action,
        })
        .await
        .map(|_| ())
    }

    async fn cancel_on_disconnect(&self, path: &str) -> Result<(), StoreError> {
        self.request(Op::CancelOnDisconnect {
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }
}
