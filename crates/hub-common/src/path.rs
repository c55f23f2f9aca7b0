//! Mapping between peer addresses and relay socket paths.
//!
//! Hosts connect to `/ws/host/<host_id>` and clients to
//! `/ws/client/<client_id>`.

use crate::envelope::{PeerId, PeerKind};

/// Longest identifier accepted in a socket path.
pub const MAX_ID_LEN: usize = 128;

/// Socket path for a host or client.
#[must_use]
pub fn socket_path(peer: &PeerId) -> String {
    format!("/ws/{}/{}", peer.kind, peer.id)
}

/// Full socket URL for `peer` under `relay_url`, tolerating a trailing slash.
///
/// # Examples
///
/// ```
/// use hub_common::{path, PeerId};
///
/// let url = path::socket_url("wss://relay.example/", &PeerId::client("c1"));
/// assert_eq!(url, "wss://relay.example/ws/client/c1");
/// ```
#[must_use]
pub fn socket_url(relay_url: &str, peer: &PeerId) -> String {
    format!("{}{}", relay_url.trim_end_matches('/'), socket_path(peer))
}

/// Parse a request path into the peer it names.
///
/// Only host and client paths are valid, and ids are limited to ASCII
/// letters, digits, `-` and `_`.
#[must_use]
pub fn parse_socket_path(path: &str) -> Option<PeerId> {
    let rest = path.strip_prefix("/ws/")?;
    let (kind, id) = rest.split_once('/')?;
    let kind = match kind {
        "host" => PeerKind::Host,
        "client" => PeerKind::Client,
        _ => return None,
    };
    if !is_valid_id(id) {
        return None;
    }
    Some(PeerId::new(kind, id))
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_client() {
        assert_eq!(parse_socket_path("/ws/host/mac-mini"), Some(PeerId::host("mac-mini")));
        assert_eq!(
            parse_socket_path("/ws/client/6F9619FF-8B86-D011-B42D-00C04FC964FF"),
            Some(PeerId::client("6F9619FF-8B86-D011-B42D-00C04FC964FF"))
        );
    }

    #[test]
    fn rejects_other_paths() {
        for path in [
            "/",
            "/ws",
            "/ws/host",
            "/ws/host/",
            "/ws/relay/relay",
            "/ws/host/a/b",
            "/ws/client/has space",
            "/api/host/x",
        ] {
            assert_eq!(parse_socket_path(path), None, "{path}");
        }
    }

    #[test]
    fn rejects_overlong_id() {
        let id = "a".repeat(MAX_ID_LEN + 1);
        assert_eq!(parse_socket_path(&format!("/ws/host/{id}")), None);
    }

    #[test]
    fn path_roundtrip() {
        let peer = PeerId::host("h1");
        assert_eq!(parse_socket_path(&socket_path(&peer)), Some(peer));
    }
}
