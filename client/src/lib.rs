//! Headless game client runtime: client-side prediction, server
//! reconciliation, remote-entity interpolation and the map transport.
//!
//! Rendering is an external consumer; it reads
//! [`runtime::ClientRuntime::render_game_state`] and drives the
//! simulation through `advance_time`.

pub mod game;
pub mod input;
pub mod network;
pub mod runtime;
pub mod snapshot_store;
