//! Per-message routing decisions.
//!
//! [`dispatch`] is synchronous: it reads one inbound text frame, updates the
//! connection's [`ConnectionContext`] and the registry, and returns the
//! [`Action`] the connection loop should carry out. Relay-interpreted types
//! are handled here; every other type is forwarded verbatim once the
//! sender is authenticated and allowed to reach the target.

use crate::metrics::counters;
use crate::registry::{ConnHandle, HostRegistration};
use crate::server::ServerState;
use chrono::Utc;
use hub_common::envelope::{self, EnvelopeHeader};
use hub_common::messages::{
    AuthenticatedPayload, ChallengePayload, ClientHelloPayload, HostRegisterPayload,
    PairingApprovePayload, PairingCreatePayload, PairingCreatedPayload,
    PairingPendingApprovalPayload, PairingRequestPayload, PairingSuccessPayload,
    SignedChallengePayload,
};
use hub_common::types::message_type;
use hub_common::{PeerId, PeerKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What the relay knows about one socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Identity taken from the socket path.
    pub peer: PeerId,
    /// Whether the peer completed a challenge on this socket.
    pub authenticated: bool,
    /// For authenticated clients: the host they proved trust with.
    pub bound_host: Option<String>,
}

impl ConnectionContext {
    /// Context for a freshly accepted socket.
    #[must_use]
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            authenticated: false,
            bound_host: None,
        }
    }
}

/// Outcome of dispatching one inbound message.
#[derive(Debug)]
pub enum Action {
    /// Nothing to send.
    None,
    /// Send this text back on the same socket.
    Reply(String),
    /// Queue this text on another connection.
    Deliver {
        /// Destination connection.
        to: ConnHandle,
        /// Text to deliver.
        text: String,
    },
    /// Close the socket.
    Close,
}

/// Decide what to do with one inbound text frame.
pub fn dispatch(state: &ServerState, ctx: &mut ConnectionContext, text: &str) -> Action {
    let header = match envelope::decode_header(text) {
        Ok(header) => header,
        Err(e) => {
            debug!(peer = %ctx.peer, error = %e, "dropping undecodable message");
            counters::messages_dropped_total("malformed");
            return Action::None;
        }
    };

    match ctx.peer.kind {
        PeerKind::Host => handle_host(state, ctx, &header, text),
        PeerKind::Client => handle_client(state, ctx, &header, text),
        PeerKind::Relay => Action::None,
    }
}

fn handle_host(
    state: &ServerState,
    ctx: &mut ConnectionContext,
    header: &EnvelopeHeader,
    text: &str,
) -> Action {
    let host_id = ctx.peer.id.clone();
    match header.message_type.as_str() {
        message_type::HOST_REGISTER => {
            let Some(payload) = payload::<HostRegisterPayload>(text) else {
                return Action::None;
            };
            info!(host_id = %host_id, name = %payload.display_name, platform = %payload.platform, "host registered");
            state
                .registry
                .register_host(&host_id, HostRegistration::from(payload));
            Action::None
        }
        message_type::HOST_HELLO => {
            let challenge = state
                .registry
                .create_challenge(&host_id, state.config.challenge_ttl());
            reply(
                message_type::CHALLENGE,
                &ctx.peer,
                ChallengePayload {
                    nonce: challenge.nonce,
                    expires_at: challenge.expires_at,
                },
            )
        }
        message_type::HOST_AUTH => {
            let Some(payload) = payload::<SignedChallengePayload>(text) else {
                return Action::None;
            };
            if state
                .registry
                .verify_host_signature(&host_id, &payload.nonce, &payload.signature)
            {
                ctx.authenticated = true;
                counters::auth_total("host", "accepted");
                info!(host_id = %host_id, "host authenticated");
                reply(
                    message_type::HOST_AUTHENTICATED,
                    &ctx.peer,
                    AuthenticatedPayload {
                        authenticated_at: Utc::now(),
                    },
                )
            } else {
                counters::auth_total("host", "rejected");
                warn!(host_id = %host_id, "host authentication failed");
                Action::Close
            }
        }
        message_type::PAIRING_CREATE => {
            if !ctx.authenticated {
                return drop_message(ctx, header, "unauthenticated");
            }
            let Some(payload) = payload::<PairingCreatePayload>(text) else {
                return Action::None;
            };
            let ttl = state.config.pairing_ttl(payload.ttl_seconds);
            let challenge = state.registry.create_pairing_challenge(&host_id, ttl);
            counters::pairing_total("created");
            info!(host_id = %host_id, ttl_secs = ttl.as_secs(), "pairing challenge created");
            reply(
                message_type::PAIRING_CREATED,
                &ctx.peer,
                PairingCreatedPayload {
                    challenge_id: challenge.challenge_id,
                    nonce: challenge.nonce,
                    expires_at: challenge.expires_at,
                    relay_url: state.config.public_url.clone(),
                },
            )
        }
        message_type::PAIRING_APPROVE => {
            if !ctx.authenticated {
                return drop_message(ctx, header, "unauthenticated");
            }
            let Some(payload) = payload::<PairingApprovePayload>(text) else {
                return Action::None;
            };
            let Some(approved) =
                state
                    .registry
                    .approve_pairing(&host_id, &payload.client_id, &payload.challenge_id)
            else {
                counters::pairing_total("rejected");
                debug!(host_id = %host_id, client_id = %payload.client_id, "pairing approval did not match a pending request");
                return Action::None;
            };
            counters::pairing_total("approved");
            info!(host_id = %host_id, client_id = %approved.client_id, device = %approved.device_name, "client paired");

            let registration = state.registry.host_registration(&host_id);
            let success = PairingSuccessPayload {
                host_id: host_id.clone(),
                host_name: registration
                    .as_ref()
                    .map(|r| r.display_name.clone())
                    .unwrap_or_default(),
                host_public_key: registration.map(|r| r.public_key).unwrap_or_default(),
            };
            let client = PeerId::client(approved.client_id);
            deliver_from_relay(state, &client, message_type::PAIRING_SUCCESS, success)
        }
        _ => forward(state, ctx, header, text),
    }
}

fn handle_client(
    state: &ServerState,
    ctx: &mut ConnectionContext,
    header: &EnvelopeHeader,
    text: &str,
) -> Action {
    let client_id = ctx.peer.id.clone();
    match header.message_type.as_str() {
        message_type::PAIRING_REQUEST => {
            let Some(payload) = payload::<PairingRequestPayload>(text) else {
                return Action::None;
            };
            let Some(pending) = state.registry.begin_pairing_request(&payload, &client_id) else {
                counters::pairing_total("rejected");
                debug!(client_id = %client_id, host_id = %payload.host_id, "pairing request did not match a live challenge");
                return Action::None;
            };
            counters::pairing_total("requested");
            info!(client_id = %client_id, host_id = %pending.host_id, device = %pending.device_name, "pairing request awaiting approval");
            let host = PeerId::host(pending.host_id);
            deliver_from_relay(
                state,
                &host,
                message_type::PAIRING_PENDING_APPROVAL,
                PairingPendingApprovalPayload {
                    client_id: pending.client_id,
                    device_name: pending.device_name,
                    public_key: pending.public_key,
                    challenge_id: pending.challenge_id,
                },
            )
        }
        message_type::CLIENT_HELLO => {
            let Some(payload) = payload::<ClientHelloPayload>(text) else {
                return Action::Close;
            };
            let Some(challenge) = state.registry.create_client_challenge(
                &client_id,
                &payload.host_id,
                state.config.challenge_ttl(),
            ) else {
                counters::auth_total("client", "untrusted");
                warn!(client_id = %client_id, host_id = %payload.host_id, "hello from client the host does not trust");
                return Action::Close;
            };
            reply(
                message_type::CHALLENGE,
                &ctx.peer,
                ChallengePayload {
                    nonce: challenge.nonce,
                    expires_at: challenge.expires_at,
                },
            )
        }
        message_type::CLIENT_AUTH => {
            let Some(payload) = payload::<SignedChallengePayload>(text) else {
                return Action::None;
            };
            match state
                .registry
                .verify_client_signature(&client_id, &payload.nonce, &payload.signature)
            {
                Some(host_id) => {
                    counters::auth_total("client", "accepted");
                    info!(client_id = %client_id, host_id = %host_id, "client authenticated");
                    ctx.authenticated = true;
                    ctx.bound_host = Some(host_id);
                    reply(
                        message_type::CLIENT_AUTHENTICATED,
                        &ctx.peer,
                        AuthenticatedPayload {
                            authenticated_at: Utc::now(),
                        },
                    )
                }
                None => {
                    counters::auth_total("client", "rejected");
                    warn!(client_id = %client_id, "client authentication failed");
                    Action::Close
                }
            }
        }
        _ => forward(state, ctx, header, text),
    }
}

/// Forward an application message verbatim if the sender may reach the target.
fn forward(
    state: &ServerState,
    ctx: &ConnectionContext,
    header: &EnvelopeHeader,
    text: &str,
) -> Action {
    if !ctx.authenticated {
        return drop_message(ctx, header, "unauthenticated");
    }
    if header.source != ctx.peer {
        return drop_message(ctx, header, "source_mismatch");
    }

    let target = &header.target;
    let allowed = match (ctx.peer.kind, target.kind) {
        (PeerKind::Client, PeerKind::Host) => {
            ctx.bound_host.as_deref() == Some(target.id.as_str())
        }
        (PeerKind::Host, PeerKind::Client) => state.registry.is_trusted(&ctx.peer.id, &target.id),
        _ => false,
    };
    if !allowed {
        return drop_message(ctx, header, "not_permitted");
    }

    match state.registry.socket(target.kind, &target.id) {
        Some(to) => Action::Deliver {
            to,
            text: text.to_string(),
        },
        None => drop_message(ctx, header, "offline"),
    }
}

fn drop_message(ctx: &ConnectionContext, header: &EnvelopeHeader, reason: &'static str) -> Action {
    debug!(
        peer = %ctx.peer,
        message_type = %header.message_type,
        dest = %header.target,
        reason,
        "dropping message"
    );
    counters::messages_dropped_total(reason);
    Action::None
}

fn payload<P: DeserializeOwned>(text: &str) -> Option<P> {
    match envelope::decode::<P>(text) {
        Ok(env) => Some(env.payload),
        Err(e) => {
            debug!(error = %e, "dropping message with invalid payload");
            counters::messages_dropped_total("malformed");
            None
        }
    }
}

fn relay_text<P: Serialize>(message_type: &str, target: &PeerId, payload: P) -> Option<String> {
    match envelope::encode(message_type, PeerId::relay(), target.clone(), payload) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(message_type, error = %e, "failed to encode relay message");
            None
        }
    }
}

fn reply<P: Serialize>(message_type: &str, target: &PeerId, payload: P) -> Action {
    relay_text(message_type, target, payload).map_or(Action::None, Action::Reply)
}

fn deliver_from_relay<P: Serialize>(
    state: &ServerState,
    target: &PeerId,
    message_type: &str,
    payload: P,
) -> Action {
    let Some(to) = state.registry.socket(target.kind, &target.id) else {
        debug!(dest = %target, message_type, "recipient offline, dropping relay message");
        counters::messages_dropped_total("offline");
        return Action::None;
    };
    relay_text(message_type, target, payload).map_or(Action::None, |text| Action::Deliver { to, text })
}
