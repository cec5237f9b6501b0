// The realtime store the relay transport is written against
// Paths are slash-separated ("games/AB12C3/board"); values are JSON trees.
// A null write removes the node, and a read of a missing node is None.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

const MAX_TRANSACTION_ATTEMPTS: usize = 25;

pub type WatchId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("relay backend unavailable: {0}")]
    Unavailable(String),

    #[error("lost the connection to the relay server")]
    ConnectionClosed,

    #[error("relay server rejected the request: {0}")]
    Remote(String),

    #[error("malformed relay data: {0}")]
    Malformed(String),

    #[error("too many concurrent updates to {0}; try again")]
    Contention(String),

    #[error("invalid store path \"{0}\"")]
    InvalidPath(String),
}

/// A live subscription. The current value is delivered first, then one
/// message per change; the channel closes when the watch is cancelled or
/// the connection drops.
pub struct Watch {
    pub id: WatchId,
    pub changes: mpsc::UnboundedReceiver<Option<Value>>,
}

/// Write the server applies on our behalf once our connection is gone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisconnectAction {
    Remove,
    Update { fields: Map<String, Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CasOutcome {
    pub committed: bool,
    /// Value at the path after the attempt
    pub current: Option<Value>,
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Write several children of `path` in one step; null children are removed
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Replace the value at `path` only if it still equals `expected`
    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Value>,
        value: Option<Value>,
    ) -> Result<CasOutcome, StoreError>;

    async fn watch(&self, path: &str) -> Result<Watch, StoreError>;

    async fn unwatch(&self, id: WatchId) -> Result<(), StoreError>;

    /// Register `action` to run at `path` when this connection drops.
    /// Replaces any earlier directive for the same path.
    async fn on_disconnect(&self, path: &str, action: DisconnectAction) -> Result<(), StoreError>;

    async fn cancel_on_disconnect(&self, path: &str) -> Result<(), StoreError>;
}

pub enum TxStep {
    Commit(Option<Value>),
    Abort,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome {
    Committed(Option<Value>),
    /// The update function declined; carries the value it was shown
    Aborted(Option<Value>),
}

/// Read-modify-write at `path`, retrying while other writers race us
pub async fn run_transaction<F>(
    store: &dyn RelayStore,
    path: &str,
    mut update: F,
) -> Result<TxOutcome, StoreError>
where
    F: FnMut(Option<&Value>) -> TxStep + Send,
{
    let mut current = store.get(path).await?;

    for attempt in 0..MAX_TRANSACTION_ATTEMPTS {
        let next = match update(current.as_ref()) {
            TxStep::Abort => return Ok(TxOutcome::Aborted(current)),
            TxStep::Commit(next) => next,
        };

        let outcome = store
            .compare_and_set(path, current.clone(), next.clone())
            .await?;
        if outcome.committed {
            return Ok(TxOutcome::Committed(next));
        }

        debug!("Transaction on {} lost a race (attempt {})", path, attempt + 1);
        current = outcome.current;
    }

    Err(StoreError::Contention(path.to_string()))
}

/// Split a path into its segments, rejecting empty paths
pub fn segments(path: &str) -> Result<Vec<&str>, StoreError> {
    let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segs.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(segs)
}

pub fn join_path(base: &str, child: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), child)
}
