// Transport errors surfaced to the player
// Every message says what to do next, not just what broke

use thiserror::Error;

use super::relay::StoreError;

/// How the UI should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The backing capability is missing; show setup guidance, not a retry
    Configuration,
    /// Network hiccup; retrying the host/join action may work
    Transient,
    /// The room is already taken
    Capacity,
    /// The request conflicts with the current session
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Direct connections are not available on this device. Use an internet room instead.")]
    TcpUnavailable,

    #[error("Port {port} is already in use. Wait a moment and try again, or use a different port.")]
    PortInUse { port: u16 },

    #[error("Permission denied to bind to port {port}. Try a port above 1024 (e.g. 8888 or 9999).")]
    PermissionDenied { port: u16 },

    #[error("Could not start hosting on port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Could not connect to {address}: {reason}. Check the address and that the host is waiting.")]
    ConnectFailed { address: String, reason: String },

    #[error("Timed out connecting to {address}. Make sure both devices are on the same network.")]
    ConnectTimedOut { address: String },

    #[error("No opponent joined within {secs} seconds. Start hosting again when they are ready.")]
    HostTimedOut { secs: u64 },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Internet play is not set up: {0}")]
    RelayUnavailable(String),

    #[error("Room not found. Please check the room code.")]
    RoomNotFound,

    #[error("Room is full. Another player has already joined.")]
    RoomFull,

    #[error("\"{0}\" is not a valid room code. Room codes are 6 letters or digits.")]
    InvalidRoomCode(String),

    #[error("You are already in this room.")]
    AlreadyInRoom,

    #[error("You are already connected to another room. Please disconnect first.")]
    AlreadyConnected,

    #[error("You cannot join your own room. Create a new room or have someone else join.")]
    OwnRoom,

    #[error("The host closed the room.")]
    RoomClosed,

    #[error("Internet play failed: {0}")]
    Backend(#[from] StoreError),
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::TcpUnavailable | TransportError::RelayUnavailable(_) => {
                ErrorClass::Configuration
            }
            TransportError::PermissionDenied { .. } => ErrorClass::Configuration,
            TransportError::RoomFull => ErrorClass::Capacity,
            TransportError::InvalidRoomCode(_)
            | TransportError::AlreadyInRoom
            | TransportError::AlreadyConnected
            | TransportError::OwnRoom => ErrorClass::Session,
            TransportError::Backend(StoreError::Unavailable(_)) => ErrorClass::Configuration,
            _ => ErrorClass::Transient,
        }
    }

    /// Map a listener bind failure onto an actionable error
    pub fn from_bind(port: u16, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => TransportError::PortInUse { port },
            std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied { port },
            std::io::ErrorKind::Unsupported => TransportError::TcpUnavailable,
            _ => TransportError::BindFailed {
                port,
                reason: err.to_string(),
            },
        }
    }
}
