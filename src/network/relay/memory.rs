// In-process realtime store
// Backs the relay server and doubles as the test backend. Each MemoryClient
// is one "connection": dropping it cancels its watches and runs its
// on-disconnect directives, like a browser tab closing.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use super::store::{
    join_path, segments, CasOutcome, DisconnectAction, RelayStore, StoreError, Watch, WatchId,
};

/// The shared tree; cheap to clone
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    root: Value,
    watchers: HashMap<WatchId, Watcher>,
    directives: Vec<Directive>,
    next_watch: WatchId,
    next_client: u64,
}

struct Watcher {
    client: u64,
    path: Vec<String>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct Directive {
    client: u64,
    path: String,
    action: DisconnectAction,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the store
    pub fn client(&self) -> MemoryClient {
        let id = {
            let mut st = self.lock();
            st.next_client += 1;
            st.next_client
        };
        MemoryClient {
            store: self.clone(),
            id,
        }
    }

    /// Read without a connection
    pub fn read(&self, path: &str) -> Option<Value> {
        let segs = segments(path).ok()?;
        get_at(&self.lock().root, &segs).cloned()
    }

    /// Deliver the current value at `path` to its watchers again, as a
    /// flaky realtime backend sometimes does
    pub fn redeliver(&self, path: &str) {
        let Ok(segs) = segments(path) else {
            return;
        };
        let st = self.lock();
        let value = get_at(&st.root, &segs).cloned();
        for watcher in st.watchers.values() {
            if watcher.path.iter().map(String::as_str).eq(segs.iter().copied()) {
                let _ = watcher.tx.send(value.clone());
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a write and notify every watcher whose value changed
    fn mutate<R>(&self, write: impl FnOnce(&mut Value) -> R) -> R {
        let mut guard = self.lock();
        let st = &mut *guard;

        let before: Vec<(WatchId, Option<Value>)> = st
            .watchers
            .iter()
            .map(|(id, w)| (*id, get_at(&st.root, &w.path).cloned()))
            .collect();

        let result = write(&mut st.root);

        let mut closed = Vec::new();
        for (id, old) in before {
            let Some(watcher) = st.watchers.get(&id) else {
                continue;
            };
            let new = get_at(&st.root, &watcher.path).cloned();
            if new != old && watcher.tx.send(new).is_err() {
                closed.push(id);
            }
        }
        for id in closed {
            st.watchers.remove(&id);
        }

        result
    }
}

/// One connection to a MemoryStore. Clones share the connection.
#[derive(Clone)]
pub struct MemoryClient {
    store: MemoryStore,
    id: u64,
}

impl MemoryClient {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Simulate losing the connection: watches close, directives run
    pub fn drop_connection(&self) {
        let directives: Vec<Directive> = {
            let mut st = self.store.lock();
            st.watchers.retain(|_, w| w.client != self.id);
            let (mine, rest) = std::mem::take(&mut st.directives)
                .into_iter()
                .partition(|d| d.client == self.id);
            st.directives = rest;
            mine
        };

        if directives.is_empty() {
            return;
        }
        debug!("Client {} dropped; running {} directive(s)", self.id, directives.len());

        self.store.mutate(|root| {
            for directive in directives {
                let Ok(segs) = segments(&directive.path) else {
                    continue;
                };
                match directive.action {
                    DisconnectAction::Remove => {
                        remove_at(root, &segs);
                    }
                    DisconnectAction::Update { fields } => {
                        // Only touches a node that still exists
                        if get_at(root, &segs).is_some() {
                            apply_update(root, &directive.path, fields);
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RelayStore for MemoryClient {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let segs = segments(path)?;
        Ok(get_at(&self.store.lock().root, &segs).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let segs = segments(path)?;
        self.store.mutate(|root| write_at(root, &segs, value));
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<(), StoreError> {
        segments(path)?;
        self.store.mutate(|root| apply_update(root, path, fields));
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let segs = segments(path)?;
        self.store.mutate(|root| remove_at(root, &segs));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: Option<Value>,
        value: Option<Value>,
    ) -> Result<CasOutcome, StoreError> {
        let segs = segments(path)?;
        let expected = expected.map(strip_nulls).filter(|v| !v.is_null());

        Ok(self.store.mutate(|root| {
            let current = get_at(root, &segs).cloned();
            if current != expected {
                return CasOutcome {
                    committed: false,
                    current,
                };
            }
            match value {
                Some(value) => write_at(root, &segs, value),
                None => {
                    remove_at(root, &segs);
                }
            }
            CasOutcome {
                committed: true,
                current: get_at(root, &segs).cloned(),
            }
        }))
    }

    async fn watch(&self, path: &str) -> Result<Watch, StoreError> {
        let segs = segments(path)?;
        let (tx, changes) = mpsc::unbounded_channel();

        let mut st = self.store.lock();
        let _ = tx.send(get_at(&st.root, &segs).cloned());
        st.next_watch += 1;
        let id = st.next_watch;
        st.watchers.insert(
            id,
            Watcher {
                client: self.id,
                path: segs.iter().map(|s| s.to_string()).collect(),
                tx,
            },
        );

        Ok(Watch { id, changes })
    }

    async fn unwatch(&self, id: WatchId) -> Result<(), StoreError> {
        let mut st = self.store.lock();
        if st.watchers.get(&id).is_some_and(|w| w.client == self.id) {
            st.watchers.remove(&id);
        }
        Ok(())
    }

    async fn on_disconnect(&self, path: &str, action: DisconnectAction) -> Result<(), StoreError> {
        let path = segments(path)?.join("/");
        let mut st = self.store.lock();
        st.directives
            .retain(|d| !(d.client == self.id && d.path == path));
        st.directives.push(Directive {
            client: self.id,
            path,
            action,
        });
        Ok(())
    }

    async fn cancel_on_disconnect(&self, path: &str) -> Result<(), StoreError> {
        let path = segments(path)?.join("/");
        self.store
            .lock()
            .directives
            .retain(|d| !(d.client == self.id && d.path == path));
        Ok(())
    }
}

fn get_at<'a, S: AsRef<str>>(root: &'a Value, segs: &[S]) -> Option<&'a Value> {
    let mut node = root;
    for seg in segs {
        node = child(node, seg.as_ref())?;
    }
    (!node.is_null()).then_some(node)
}

fn child<'a>(node: &'a Value, seg: &str) -> Option<&'a Value> {
    match node {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => items.get(seg.parse::<usize>().ok()?),
        _ => None,
    }
}

fn apply_update(root: &mut Value, path: &str, fields: Map<String, Value>) {
    for (key, value) in fields {
        let full = join_path(path, &key);
        if let Ok(segs) = segments(&full) {
            write_at(root, &segs, value);
        }
    }
}

fn write_at(root: &mut Value, segs: &[&str], value: Value) {
    let value = strip_nulls(value);
    if value.is_null() {
        remove_at(root, segs);
    } else {
        set_at(root, segs, value);
    }
}

fn set_at(node: &mut Value, segs: &[&str], value: Value) {
    let Some((first, rest)) = segs.split_first() else {
        *node = value;
        return;
    };

    if let Value::Array(items) = node {
        if let Some(slot) = first.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            set_at(slot, rest, value);
            return;
        }
    }

    let entry = ensure_object(node)
        .entry(first.to_string())
        .or_insert(Value::Null);
    set_at(entry, rest, value);
}

/// Remove the node at `segs`, pruning objects left empty. Returns true if
/// `node` itself is now empty.
fn remove_at(node: &mut Value, segs: &[&str]) -> bool {
    let Some((first, rest)) = segs.split_first() else {
        return true;
    };

    match node {
        Value::Object(map) => {
            if rest.is_empty() {
                map.remove(*first);
            } else if let Some(next) = map.get_mut(*first) {
                if remove_at(next, rest) {
                    map.remove(*first);
                }
            }
            map.is_empty()
        }
        Value::Array(items) => {
            if let Some(slot) = first.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                if rest.is_empty() || remove_at(slot, rest) {
                    *slot = Value::Null;
                }
            }
            false
        }
        _ => false,
    }
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

/// Null object members are absent members
fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect();
            if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}
