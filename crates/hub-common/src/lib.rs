//! Wire types and helpers shared by the hub relay and its peers.
//!
//! This crate provides:
//! - The JSON envelope codec and peer addressing ([`envelope`])
//! - Payload structs for every message in the catalog ([`messages`])
//! - Ed25519 challenge signing and verification ([`crypto`])
//! - The out-of-band pairing code ([`pairing`])
//! - Socket path routing ([`path`])
//! - Protocol constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod envelope;
pub mod messages;
pub mod pairing;
pub mod path;
pub mod types;

pub use envelope::{CodecError, Envelope, EnvelopeHeader, PeerId, PeerKind};
