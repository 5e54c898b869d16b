//! Map-instance server: authoritative fixed-tick simulation, combat,
//! area-of-interest replication and the WebSocket transport.

pub mod abilities;
pub mod client_manager;
pub mod combat;
pub mod game;
pub mod handshake;
pub mod network;
pub mod replication;
