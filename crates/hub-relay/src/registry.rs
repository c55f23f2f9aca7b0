//! Relay state: live sockets, host identities, challenges and the trust ledger.
//!
//! Everything lives behind one mutex so that each operation, including the
//! check-and-consume of a challenge, is atomic with respect to every other.
//! The lock is never held across an await point.

use chrono::{DateTime, Utc};
use hub_common::crypto;
use hub_common::messages::{HostRegisterPayload, PairingRequestPayload};
use hub_common::PeerKind;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Work queued for a connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Send a text frame.
    Text(String),
    /// Close the socket.
    Close,
}

/// Handle to a live connection, stored in the socket directory.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Channel into the connection's writer.
    pub tx: mpsc::Sender<Outgoing>,
    /// Unique per accepted socket; guards conditional removal.
    pub conn_id: u64,
}

/// Identity a host registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRegistration {
    /// Human readable machine name.
    pub display_name: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// Host application version.
    pub app_version: String,
    /// Host operating system.
    pub platform: String,
}

impl From<HostRegisterPayload> for HostRegistration {
    fn from(p: HostRegisterPayload) -> Self {
        Self {
            display_name: p.display_name,
            public_key: p.public_key,
            app_version: p.app_version,
            platform: p.platform,
        }
    }
}

/// A nonce handed out to a host or client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedChallenge {
    /// Base64 random nonce.
    pub nonce: String,
    /// Deadline for the signed answer.
    pub expires_at: DateTime<Utc>,
}

/// A one-time pairing code issued for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingChallenge {
    /// Challenge id.
    pub challenge_id: String,
    /// Host the code belongs to.
    pub host_id: String,
    /// Nonce the client must echo.
    pub nonce: String,
    /// When the code stops working.
    pub expires_at: DateTime<Utc>,
}

/// A client's pairing request awaiting host approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPairingRequest {
    /// Host being asked.
    pub host_id: String,
    /// Requesting client.
    pub client_id: String,
    /// Device name the client reported.
    pub device_name: String,
    /// Client public key.
    pub public_key: String,
    /// Challenge the request answers.
    pub challenge_id: String,
}

#[derive(Debug)]
struct ClientChallenge {
    host_id: String,
    challenge: IssuedChallenge,
}

/// Counts of entries removed by [`Registry::purge_expired`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeStats {
    /// Host and client authentication challenges.
    pub auth_challenges: usize,
    /// Pairing challenges, together with their pending requests.
    pub pairing_challenges: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    host_sockets: HashMap<String, ConnHandle>,
    client_sockets: HashMap<String, ConnHandle>,
    host_registrations: HashMap<String, HostRegistration>,
    host_challenges: HashMap<String, IssuedChallenge>,
    client_challenges: HashMap<String, ClientChallenge>,
    pairing_challenges: HashMap<String, PairingChallenge>,
    pending_pairings: HashMap<String, PendingPairingRequest>,
    // host_id -> client_id -> client public key
    trusted_clients: HashMap<String, HashMap<String, String>>,
}

impl RegistryState {
    fn sockets(&mut self, kind: PeerKind) -> Option<&mut HashMap<String, ConnHandle>> {
        match kind {
            PeerKind::Host => Some(&mut self.host_sockets),
            PeerKind::Client => Some(&mut self.client_sockets),
            PeerKind::Relay => None,
        }
    }
}

/// In-memory relay registry.
#[derive(Debug, Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn is_live(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at > now
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every operation leaves the maps consistent before it can panic.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `handle` as the live socket for a peer, returning the one it displaced.
    pub fn set_socket(&self, kind: PeerKind, id: &str, handle: ConnHandle) -> Option<ConnHandle> {
        let mut state = self.lock();
        state.sockets(kind)?.insert(id.to_string(), handle)
    }

    /// Remove a peer's socket unconditionally.
    pub fn remove_socket(&self, kind: PeerKind, id: &str) -> Option<ConnHandle> {
        let mut state = self.lock();
        state.sockets(kind)?.remove(id)
    }

    /// Remove a peer's socket only if it is still the connection `conn_id`.
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove_socket_if(&self, kind: PeerKind, id: &str, conn_id: u64) -> bool {
        let mut state = self.lock();
        let Some(sockets) = state.sockets(kind) else {
            return false;
        };
        if sockets.get(id).is_some_and(|h| h.conn_id == conn_id) {
            sockets.remove(id);
            true
        } else {
            false
        }
    }

    /// Current socket for a peer.
    #[must_use]
    pub fn socket(&self, kind: PeerKind, id: &str) -> Option<ConnHandle> {
        let mut state = self.lock();
        state.sockets(kind)?.get(id).cloned()
    }

    /// Number of live host and client sockets.
    #[must_use]
    pub fn socket_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.host_sockets.len(), state.client_sockets.len())
    }

    /// Record or replace a host's identity.
    pub fn register_host(&self, host_id: &str, registration: HostRegistration) {
        self.lock()
            .host_registrations
            .insert(host_id.to_string(), registration);
    }

    /// Registered identity of a host.
    #[must_use]
    pub fn host_registration(&self, host_id: &str) -> Option<HostRegistration> {
        self.lock().host_registrations.get(host_id).cloned()
    }

    /// Issue a host authentication challenge, replacing any outstanding one.
    pub fn create_challenge(&self, host_id: &str, ttl: Duration) -> IssuedChallenge {
        let challenge = IssuedChallenge {
            nonce: crypto::generate_nonce(),
            expires_at: expiry_after(ttl),
        };
        self.lock()
            .host_challenges
            .insert(host_id.to_string(), challenge.clone());
        challenge
    }

    /// Verify a host's signed answer, consuming the challenge on success.
    ///
    /// Fails when the host is unregistered, has no live challenge, presents
    /// a different nonce, or the signature does not verify against the
    /// registered key. A failed attempt leaves the challenge in place.
    pub fn verify_host_signature(&self, host_id: &str, nonce: &str, signature: &str) -> bool {
        let mut state = self.lock();
        let valid = {
            let Some(registration) = state.host_registrations.get(host_id) else {
                return false;
            };
            let Some(challenge) = state.host_challenges.get(host_id) else {
                return false;
            };
            challenge.nonce == nonce
                && is_live(challenge.expires_at, Utc::now())
                && crypto::verify_nonce(&registration.public_key, nonce, signature)
        };
        if valid {
            state.host_challenges.remove(host_id);
        }
        valid
    }

    /// Issue a client challenge against `host_id`.
    ///
    /// Returns `None` when the client is not in that host's trust ledger.
    pub fn create_client_challenge(
        &self,
        client_id: &str,
        host_id: &str,
        ttl: Duration,
    ) -> Option<IssuedChallenge> {
        let mut state = self.lock();
        let trusted = state
            .trusted_clients
            .get(host_id)
            .is_some_and(|clients| clients.contains_key(client_id));
        if !trusted {
            return None;
        }
        let challenge = IssuedChallenge {
            nonce: crypto::generate_nonce(),
            expires_at: expiry_after(ttl),
        };
        state.client_challenges.insert(
            client_id.to_string(),
            ClientChallenge {
                host_id: host_id.to_string(),
                challenge: challenge.clone(),
            },
        );
        Some(challenge)
    }

    /// Verify a client's signed answer, consuming the challenge on success.
    ///
    /// Returns the host the client is now bound to.
    pub fn verify_client_signature(
        &self,
        client_id: &str,
        nonce: &str,
        signature: &str,
    ) -> Option<String> {
        let mut state = self.lock();
        let host_id = {
            let pending = state.client_challenges.get(client_id)?;
            let public_key = state
                .trusted_clients
                .get(&pending.host_id)?
                .get(client_id)?;
            let valid = pending.challenge.nonce == nonce
                && is_live(pending.challenge.expires_at, Utc::now())
                && crypto::verify_nonce(public_key, nonce, signature);
            if !valid {
                return None;
            }
            pending.host_id.clone()
        };
        state.client_challenges.remove(client_id);
        Some(host_id)
    }

    /// Issue a one-time pairing challenge for a host.
    pub fn create_pairing_challenge(&self, host_id: &str, ttl: Duration) -> PairingChallenge {
        let challenge = PairingChallenge {
            challenge_id: Uuid::new_v4().to_string(),
            host_id: host_id.to_string(),
            nonce: crypto::generate_nonce(),
            expires_at: expiry_after(ttl),
        };
        self.lock()
            .pairing_challenges
            .insert(challenge.challenge_id.clone(), challenge.clone());
        challenge
    }

    /// Record a client's pairing request if it matches a live pairing challenge.
    ///
    /// A later request for the same challenge replaces the earlier one.
    pub fn begin_pairing_request(
        &self,
        request: &PairingRequestPayload,
        client_id: &str,
    ) -> Option<PendingPairingRequest> {
        let mut state = self.lock();
        let challenge = state.pairing_challenges.get(&request.challenge_id)?;
        if challenge.host_id != request.host_id
            || challenge.nonce != request.nonce
            || !is_live(challenge.expires_at, Utc::now())
        {
            return None;
        }
        let pending = PendingPairingRequest {
            host_id: request.host_id.clone(),
            client_id: client_id.to_string(),
            device_name: request.device_name.clone(),
            public_key: request.public_key.clone(),
            challenge_id: request.challenge_id.clone(),
        };
        state
            .pending_pairings
            .insert(request.challenge_id.clone(), pending.clone());
        Some(pending)
    }

    /// Approve a pending request and add the client to the host's trust ledger.
    ///
    /// The request must exist, name this host and client, and its pairing
    /// challenge must still be live. Both the request and the challenge are
    /// consumed.
    pub fn approve_pairing(
        &self,
        host_id: &str,
        client_id: &str,
        challenge_id: &str,
    ) -> Option<PendingPairingRequest> {
        let mut state = self.lock();
        let pending = state.pending_pairings.get(challenge_id)?;
        if pending.host_id != host_id || pending.client_id != client_id {
            return None;
        }
        let live = state
            .pairing_challenges
            .get(challenge_id)
            .is_some_and(|c| is_live(c.expires_at, Utc::now()));
        if !live {
            return None;
        }
        let pending = state.pending_pairings.remove(challenge_id)?;
        state.pairing_challenges.remove(challenge_id);
        state
            .trusted_clients
            .entry(host_id.to_string())
            .or_default()
            .insert(client_id.to_string(), pending.public_key.clone());
        Some(pending)
    }

    /// Public key a host trusts for `client_id`.
    #[must_use]
    pub fn trusted_client_key(&self, host_id: &str, client_id: &str) -> Option<String> {
        self.lock()
            .trusted_clients
            .get(host_id)?
            .get(client_id)
            .cloned()
    }

    /// Whether `client_id` is in `host_id`'s trust ledger.
    #[must_use]
    pub fn is_trusted(&self, host_id: &str, client_id: &str) -> bool {
        self.trusted_client_key(host_id, client_id).is_some()
    }

    /// Drop expired challenges. Pending pairing requests go with their challenge.
    pub fn purge_expired(&self) -> PurgeStats {
        let now = Utc::now();
        let mut state = self.lock();
        let before_host = state.host_challenges.len();
        let before_client = state.client_challenges.len();
        let before_pairing = state.pairing_challenges.len();

        state
            .host_challenges
            .retain(|_, c| is_live(c.expires_at, now));
        state
            .client_challenges
            .retain(|_, c| is_live(c.challenge.expires_at, now));
        state
            .pairing_challenges
            .retain(|_, c| is_live(c.expires_at, now));
        let RegistryState {
            pairing_challenges,
            pending_pairings,
            ..
        } = &mut *state;
        pending_pairings.retain(|id, _| pairing_challenges.contains_key(id));

        PurgeStats {
            auth_challenges: (before_host - state.host_challenges.len())
                + (before_client - state.client_challenges.len()),
            pairing_challenges: before_pairing - state.pairing_challenges.len(),
        }
    }
}
