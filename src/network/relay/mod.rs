// Relay play: two clients meet in a room on a shared realtime store
//
// store.rs     the store contract (get/set/update/watch/transactions/on-disconnect)
// memory.rs    in-process store, used by the relay server and by tests
// remote.rs    the store contract over a WebSocket to the relay server
// server.rs    the relay server loop
// transport.rs RelayTransport, the room and game logic on top of a store

pub mod dedup;
pub mod memory;
pub mod remote;
pub mod schema;
pub mod server;
pub mod store;
pub mod transport;
pub mod wire;

pub use memory::{MemoryClient, MemoryStore};
pub use remote::WsStore;
pub use schema::{GameSnapshot, LastMove, RoomCode, RoomRecord};
pub use store::{
    run_transaction, CasOutcome, DisconnectAction, RelayStore, StoreError, TxOutcome, TxStep,
    Watch, WatchId,
};
pub use transport::{RelayBackend, RelayTransport};
