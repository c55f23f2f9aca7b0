//! JSON envelope codec and peer addressing.
//!
//! Every message on the wire is a UTF-8 JSON object of the form
//!
//! ```text
//! { "v": 1, "type": "...", "message_id": "<uuid>", "timestamp": "<rfc3339>",
//!   "source": { "kind": "host", "id": "..." },
//!   "target": { "kind": "relay", "id": "relay" },
//!   "payload": { ... } }
//! ```
//!
//! Decoding happens in two stages. [`decode_header`] reads everything except
//! the payload so a router can act on `type`, `source` and `target` without
//! knowing the payload schema; [`decode`] then parses the full envelope once
//! the type is known.

use crate::types::{PROTOCOL_VERSION, RELAY_ID};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while encoding or decoding envelopes.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The text was not a well-formed envelope for the requested payload.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Role of a protocol participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    /// Desktop machine that owns terminal sessions.
    Host,
    /// Mobile device that views and drives a host's sessions.
    Client,
    /// The rendezvous relay itself.
    Relay,
}

impl PeerKind {
    /// Wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Client => "client",
            Self::Relay => "relay",
        }
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a participant: its role plus an opaque identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId {
    /// Role of the participant.
    pub kind: PeerKind,
    /// Stable identifier, unique within `kind`.
    pub id: String,
}

impl PeerId {
    /// Build an address from its parts.
    pub fn new(kind: PeerKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Address of a host.
    pub fn host(id: impl Into<String>) -> Self {
        Self::new(PeerKind::Host, id)
    }

    /// Address of a client.
    pub fn client(id: impl Into<String>) -> Self {
        Self::new(PeerKind::Client, id)
    }

    /// Address the relay uses for envelopes it originates.
    #[must_use]
    pub fn relay() -> Self {
        Self::new(PeerKind::Relay, RELAY_ID)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Envelope fields without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Schema version.
    pub v: u32,
    /// Message type tag, see [`crate::types::message_type`].
    #[serde(rename = "type")]
    pub message_type: String,
    /// Unique message identifier.
    pub message_id: Uuid,
    /// Creation time.
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
    /// Sender address.
    pub source: PeerId,
    /// Recipient address.
    pub target: PeerId,
}

/// A complete message with a typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    /// Schema version.
    pub v: u32,
    /// Message type tag, see [`crate::types::message_type`].
    #[serde(rename = "type")]
    pub message_type: String,
    /// Unique message identifier.
    pub message_id: Uuid,
    /// Creation time.
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,
    /// Sender address.
    pub source: PeerId,
    /// Recipient address.
    pub target: PeerId,
    /// Type-specific body.
    pub payload: P,
}

impl<P> Envelope<P> {
    /// Wrap `payload` in a fresh envelope stamped with a new id and the current time.
    pub fn new(message_type: &str, source: PeerId, target: PeerId, payload: P) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            message_type: message_type.to_string(),
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            target,
            payload,
        }
    }

    /// Copy of the header fields.
    #[must_use]
    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            v: self.v,
            message_type: self.message_type.clone(),
            message_id: self.message_id,
            timestamp: self.timestamp,
            source: self.source.clone(),
            target: self.target.clone(),
        }
    }
}

impl<P: Serialize> Envelope<P> {
    /// Serialize to the JSON text sent on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }
}

/// Build and serialize an envelope in one step.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if the payload cannot be serialized.
pub fn encode<P: Serialize>(
    message_type: &str,
    source: PeerId,
    target: PeerId,
    payload: P,
) -> Result<String, CodecError> {
    Envelope::new(message_type, source, target, payload).encode()
}

/// Decode only the header, ignoring whatever the payload contains.
///
/// # Examples
///
/// ```
/// use hub_common::envelope::decode_header;
/// use hub_common::PeerKind;
///
/// let text = r#"{"v":1,"type":"list-sessions",
///     "message_id":"7d0b5c1e-7f55-4b8f-9f0a-3c1d2e4f5a6b",
///     "timestamp":"2026-01-01T12:00:00.000Z",
///     "source":{"kind":"client","id":"c1"},
///     "target":{"kind":"host","id":"h1"},
///     "payload":{"anything":[1,2,3]}}"#;
/// let header = decode_header(text).unwrap();
/// assert_eq!(header.message_type, "list-sessions");
/// assert_eq!(header.target.kind, PeerKind::Host);
/// ```
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the header fields are missing or invalid.
pub fn decode_header(text: &str) -> Result<EnvelopeHeader, CodecError> {
    serde_json::from_str(text).map_err(CodecError::Malformed)
}

/// Decode a full envelope with payload type `P`.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the text does not match `Envelope<P>`.
pub fn decode<P: DeserializeOwned>(text: &str) -> Result<Envelope<P>, CodecError> {
    serde_json::from_str(text).map_err(CodecError::Malformed)
}

/// RFC 3339 timestamps with millisecond precision and a `Z` suffix.
///
/// Decoding accepts any RFC 3339 offset and fractional precision.
pub mod iso8601 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Format `value` for the wire.
    #[must_use]
    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Serde serializer.
    ///
    /// # Errors
    ///
    /// Propagates the serializer's error.
    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    /// Serde deserializer.
    ///
    /// # Errors
    ///
    /// Fails when the string is not RFC 3339.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
