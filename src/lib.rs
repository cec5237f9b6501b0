// Tic-tac-toe multiplayer synchronization
// Keeps board, turn order and terminal state consistent across two clients,
// over a direct LAN socket or through a shared relay store

pub mod config;
pub mod debug;
pub mod game;
pub mod network;
pub mod session;
