// Relay server for internet play
// Holds rooms and games in memory and serves them to clients over WebSocket.
// Rooms vanish on their own when the host's connection drops.
//
// Usage: relay-server [bind-address]   (default 0.0.0.0:9001)

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use tictactoe_net::network::relay::server;
use tictactoe_net::network::relay::MemoryStore;

const DEFAULT_ADDR: &str = "0.0.0.0:9001";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Clients connect with relay.server_url = \"ws://<this-host>:{}\"", listener.local_addr()?.port());

    server::serve(listener, MemoryStore::new()).await?;
    Ok(())
}
