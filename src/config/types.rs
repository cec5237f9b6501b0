// Configuration types
// Every section falls back to its defaults, so partial files are fine

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Direct (LAN) play over a TCP socket
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalConfig {
    // Set to false on devices without raw TCP support
    pub enabled: bool,

    // Port the host listens on, and the default port a client dials
    pub default_port: u16,

    // How long a client waits for the host to accept
    pub connect_timeout_secs: u64,

    // How long a host waits for a peer (0 = forever)
    pub host_wait_timeout_secs: u64,

    // Ping cadence once connected (0 = off)
    pub keepalive_interval_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_port: 8888,
            connect_timeout_secs: 10,
            host_wait_timeout_secs: 300, // 5 minutes to get the other device on the network
            keepalive_interval_ms: 2000,
        }
    }
}

impl LocalConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn host_wait_timeout(&self) -> Option<Duration> {
        (self.host_wait_timeout_secs > 0).then(|| Duration::from_secs(self.host_wait_timeout_secs))
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
}

/// Internet play through the shared relay store
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    // Relay server WebSocket URL (empty = internet play unavailable)
    pub server_url: String,

    // Timeout for reaching the relay server
    pub connect_timeout_secs: u64,

    // How long a host waits for someone to claim the room (0 = forever)
    pub claim_timeout_secs: u64,

    // Repeated lastMove notifications inside this window are dropped
    pub dedup_window_ms: u64,

    // Winner/draw notifications are ignored this long after a reset
    pub reset_suppression_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9001".to_string(),
            connect_timeout_secs: 10,
            claim_timeout_secs: 300,
            dedup_window_ms: 1000,
            reset_suppression_ms: 500,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn claim_timeout(&self) -> Option<Duration> {
        (self.claim_timeout_secs > 0).then(|| Duration::from_secs(self.claim_timeout_secs))
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn reset_suppression(&self) -> Duration {
        Duration::from_millis(self.reset_suppression_ms)
    }
}
