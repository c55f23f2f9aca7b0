//! Out-of-band pairing code.
//!
//! The host renders this JSON as a QR code; the client scans it and uses
//! the fields to build a `pairing-request`. It never travels through the
//! relay as an envelope.

use crate::envelope::{iso8601, CodecError};
use crate::messages::PairingCreatedPayload;
use crate::types::PROTOCOL_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Contents of a pairing QR code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingQrPayload {
    /// Schema version.
    pub v: u32,
    /// Relay the client should connect to.
    pub relay_url: String,
    /// Host that issued the code.
    pub host_id: String,
    /// One-time challenge id.
    pub challenge_id: String,
    /// Nonce to echo back.
    pub nonce: String,
    /// When the code stops working.
    #[serde(with = "iso8601")]
    pub expires_at: DateTime<Utc>,
}

impl PairingQrPayload {
    /// Build a code from the relay's `pairing-created` reply.
    ///
    /// An empty `relay_url` in the reply falls back to `fallback_relay_url`.
    #[must_use]
    pub fn from_created(host_id: &str, fallback_relay_url: &str, created: &PairingCreatedPayload) -> Self {
        let relay_url = if created.relay_url.is_empty() {
            fallback_relay_url.to_string()
        } else {
            created.relay_url.clone()
        };
        Self {
            v: PROTOCOL_VERSION,
            relay_url,
            host_id: host_id.to_string(),
            challenge_id: created.challenge_id.clone(),
            nonce: created.nonce.clone(),
            expires_at: created.expires_at,
        }
    }

    /// Parse scanned QR text.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Malformed`] if the text is not a pairing code.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        serde_json::from_str(text.trim()).map_err(CodecError::Malformed)
    }

    /// Serialize for rendering.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// Whether the code has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn created(relay_url: &str) -> PairingCreatedPayload {
        PairingCreatedPayload {
            challenge_id: "ch-1".into(),
            nonce: "bm9uY2U=".into(),
            expires_at: Utc::now() + Duration::seconds(120),
            relay_url: relay_url.into(),
        }
    }

    #[test]
    fn built_from_relay_reply() {
        let qr = PairingQrPayload::from_created("mac", "ws://fallback", &created("wss://relay.example"));
        assert_eq!(qr.v, 1);
        assert_eq!(qr.relay_url, "wss://relay.example");
        assert_eq!(qr.host_id, "mac");
        assert_eq!(qr.challenge_id, "ch-1");
    }

    #[test]
    fn empty_relay_url_uses_fallback() {
        let qr = PairingQrPayload::from_created("mac", "ws://fallback", &created(""));
        assert_eq!(qr.relay_url, "ws://fallback");
    }

    #[test]
    fn json_roundtrip_keeps_fields() {
        let qr = PairingQrPayload::from_created("mac", "", &created("ws://r"));
        let parsed = PairingQrPayload::parse(&format!("  {}\n", qr.to_json().unwrap())).unwrap();
        assert_eq!(parsed.nonce, qr.nonce);
        assert_eq!(parsed.relay_url, "ws://r");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(PairingQrPayload::parse("https://example.com").is_err());
    }

    #[test]
    fn expiry() {
        let qr = PairingQrPayload::from_created("mac", "", &created("ws://r"));
        assert!(!qr.is_expired_at(Utc::now()));
        assert!(qr.is_expired_at(qr.expires_at));
    }
}
