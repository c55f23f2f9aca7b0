//! Host and client endpoints for the hub relay.
//!
//! Both roles share one reconnecting [`transport::Transport`]; the protocol
//! state machines in [`host`] and [`client`] sit on top of it and talk to the
//! rest of the application through the traits in [`services`] and
//! [`credentials`].
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Deterministic exponential backoff for reconnects.
pub mod backoff;
/// Client role: pairing, reconnect and the host-facing API.
pub mod client;
/// CLI parsing and TOML configuration.
pub mod config;
/// Paired-host record storage.
pub mod credentials;
/// Transport error type.
pub mod error;
/// Host role: registration, pairing approval and session serving.
pub mod host;
/// Ed25519 key and peer id persistence.
pub mod identity;
/// Collaborator traits for the host's sessions and terminals.
pub mod services;
/// Reconnecting WebSocket link to the relay.
pub mod transport;

mod wire;
