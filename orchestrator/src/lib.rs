//! Orchestrator: issues single-use join tickets, persists player
//! snapshots across map transfers, and supervises map subprocesses.

pub mod http;
pub mod store;
pub mod supervisor;
