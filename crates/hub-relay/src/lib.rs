//! Hub relay: WebSocket rendezvous between desktop hosts and mobile clients.
//!
//! Hosts authenticate with a registered Ed25519 key, issue one-time pairing
//! codes, and approve clients into a trust ledger. Paired clients then
//! authenticate against that ledger and exchange application messages with
//! their host through the relay, which never interprets those payloads.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Per-message routing decisions.
pub mod dispatch;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics, liveness and readiness endpoints.
pub mod metrics;
/// Sockets, identities, challenges and the trust ledger.
pub mod registry;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
