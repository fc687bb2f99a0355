//! `nova-hub-service`: the hub daemon.
//!
//! Owns the packet store, the processing orchestrator and the event bus,
//! and exposes them to BBS clients and the sysop over a Unix domain socket
//! speaking newline-delimited JSON-RPC-lite.

pub mod health;
pub mod ipc;
pub mod protocol;
pub mod service;

/// Protocol version for the hub IPC.
pub const PROTOCOL_VERSION: &str = "1.0";
