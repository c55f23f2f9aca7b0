//! Host half of the protocol: register, authenticate, pair new clients and
//! serve sessions to the ones already trusted.

use crate::services::{SessionProvider, TerminalSink};
use crate::transport::{RelayLink, Transport, TransportEvent};
use crate::wire::{decode_payload, send_envelope};
use hub_common::crypto::{public_key_base64, sign_nonce, SigningIdentity};
use hub_common::envelope;
use hub_common::messages::{
    ChallengePayload, CreateSessionPayload, EmptyPayload, HostRegisterPayload,
    OpenSessionPayload, PairingApprovePayload, PairingCreatePayload, PairingCreatedPayload,
    PairingPendingApprovalPayload, SessionListPayload, SessionPayload, SessionSummary,
    SignedChallengePayload, TerminalDataPayload, TerminalInputPayload, TerminalInterruptPayload,
    TerminalResizePayload,
};
use hub_common::pairing::PairingQrPayload;
use hub_common::path::socket_url;
use hub_common::types::{message_type, DEFAULT_PAIRING_TTL_SECS, MAX_SNAPSHOT_BYTES};
use hub_common::{PeerId, PeerKind};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where the host is in its bootstrap with the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// No socket.
    Disconnected,
    /// Dialing the relay.
    Connecting,
    /// Socket up, register and hello sent.
    Unauthenticated,
    /// Challenge signed, waiting for the acknowledgement.
    Authenticating,
    /// Relay accepted the signature.
    Authenticated,
}

/// Progress of a user-initiated pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingStatus {
    /// Nothing in flight.
    Idle,
    /// Waiting for the relay to hand back a challenge.
    Requested,
    /// QR payload ready to display.
    Ready {
        /// Serialized QR contents.
        qr_json: String,
        /// Same contents, structured.
        payload: PairingQrPayload,
    },
    /// The attempt gave up; the string is user-facing.
    Failed(String),
}

/// Change notifications for the host UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostUpdate {
    /// Bootstrap state changed.
    State(HostState),
    /// Pairing status changed.
    Pairing(PairingStatus),
    /// A client was approved.
    ClientPaired {
        /// New client's id.
        client_id: String,
        /// Name the device gave itself.
        device_name: String,
    },
}

/// Static host settings.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// This host's peer id.
    pub host_id: String,
    /// Name shown on clients.
    pub display_name: String,
    /// Relay base URL; pairing fails fast without one.
    pub relay_url: Option<String>,
    /// Reported in `host-register`.
    pub app_version: String,
    /// Reported in `host-register`.
    pub platform: String,
    /// How long a pairing request may wait for the relay.
    pub pairing_timeout: Duration,
    /// Lifetime requested for pairing challenges, in seconds.
    pub pairing_ttl: u64,
}

impl HostOptions {
    /// Defaults for everything but the identity.
    #[must_use]
    pub fn new(host_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            display_name: display_name.into(),
            relay_url: None,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            pairing_timeout: Duration::from_secs(15),
            pairing_ttl: DEFAULT_PAIRING_TTL_SECS,
        }
    }
}

/// Host protocol state machine.
///
/// Sans-I/O apart from the [`RelayLink`] it writes to; the caller feeds it
/// transport events, commands and the clock.
pub struct HostAgent<L> {
    link: L,
    options: HostOptions,
    me: PeerId,
    identity: Arc<dyn SigningIdentity>,
    sessions: Arc<dyn SessionProvider>,
    terminal: Arc<dyn TerminalSink>,
    state: HostState,
    pairing: PairingStatus,
    pairing_pending: bool,
    pairing_deadline: Option<Instant>,
    active_clients: BTreeSet<String>,
    requested_sizes: HashMap<Uuid, (u16, u16)>,
    updates: broadcast::Sender<HostUpdate>,
}

impl<L: RelayLink> HostAgent<L> {
    /// Build an idle agent.
    pub fn new(
        link: L,
        options: HostOptions,
        identity: Arc<dyn SigningIdentity>,
        sessions: Arc<dyn SessionProvider>,
        terminal: Arc<dyn TerminalSink>,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            link,
            me: PeerId::host(options.host_id.clone()),
            options,
            identity,
            sessions,
            terminal,
            state: HostState::Disconnected,
            pairing: PairingStatus::Idle,
            pairing_pending: false,
            pairing_deadline: None,
            active_clients: BTreeSet::new(),
            requested_sizes: HashMap::new(),
            updates,
        }
    }

    /// Receive state, pairing and approval notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<HostUpdate> {
        self.updates.subscribe()
    }

    /// Current bootstrap state.
    pub fn state(&self) -> HostState {
        self.state
    }

    /// Current pairing status.
    pub fn pairing_status(&self) -> &PairingStatus {
        &self.pairing
    }

    /// Clients that have talked to this host since it authenticated.
    pub fn active_clients(&self) -> impl Iterator<Item = &str> {
        self.active_clients.iter().map(String::as_str)
    }

    /// Terminal size last requested for a session.
    pub fn requested_size(&self, session_id: Uuid) -> Option<(u16, u16)> {
        self.requested_sizes.get(&session_id).copied()
    }

    /// When [`check_timeouts`](Self::check_timeouts) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pairing_deadline
    }

    /// The link this agent writes to.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Dial the relay if one is configured.
    pub fn start(&mut self) -> bool {
        let Some(url) = self.options.relay_url.clone() else {
            return false;
        };
        self.set_state(HostState::Connecting);
        self.link.connect(&socket_url(&url, &self.me));
        true
    }

    /// Feed one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.set_state(HostState::Unauthenticated);
                self.send_to_relay(message_type::HOST_REGISTER, self.register_payload());
                self.send_to_relay(message_type::HOST_HELLO, EmptyPayload::default());
            }
            TransportEvent::Message(text) => self.handle_message(&text),
            TransportEvent::Disconnected { reason } => {
                debug!(%reason, "host lost relay link");
                self.set_state(HostState::Disconnected);
            }
        }
    }

    fn handle_message(&mut self, text: &str) {
        let header = match envelope::decode_header(text) {
            Ok(header) => header,
            Err(e) => {
                debug!(error = %e, "ignoring frame without a valid header");
                return;
            }
        };

        match (header.source.kind, header.message_type.as_str()) {
            (PeerKind::Relay, message_type::CHALLENGE) => {
                if let Some(env) = decode_payload::<ChallengePayload>(text) {
                    self.answer_challenge(&env.payload.nonce);
                }
            }
            (PeerKind::Relay, message_type::HOST_AUTHENTICATED) => {
                info!(host_id = %self.options.host_id, "authenticated with relay");
                self.set_state(HostState::Authenticated);
                if std::mem::take(&mut self.pairing_pending) {
                    self.send_pairing_create();
                }
            }
            (PeerKind::Relay, message_type::PAIRING_CREATED) => {
                if let Some(env) = decode_payload::<PairingCreatedPayload>(text) {
                    self.on_pairing_created(&env.payload);
                }
            }
            (PeerKind::Relay, message_type::PAIRING_PENDING_APPROVAL) => {
                if let Some(env) = decode_payload::<PairingPendingApprovalPayload>(text) {
                    self.approve(env.payload);
                }
            }
            (PeerKind::Client, kind) if self.state == HostState::Authenticated => {
                self.handle_client_message(kind, header.source.id, text);
            }
            (source, kind) => debug!(%source, message_type = kind, "ignoring message"),
        }
    }

    fn handle_client_message(&mut self, kind: &str, client_id: String, text: &str) {
        self.active_clients.insert(client_id.clone());
        let client = PeerId::client(client_id);

        match kind {
            message_type::LIST_SESSIONS => {
                self.send(message_type::SESSION_LIST, client, self.session_list());
            }
            message_type::OPEN_SESSION => {
                let Some(env) = decode_payload::<OpenSessionPayload>(text) else {
                    return;
                };
                let OpenSessionPayload {
                    session_id,
                    cols,
                    rows,
                } = env.payload;
                self.requested_sizes.insert(session_id, (cols, rows));
                self.terminal.resize(session_id, cols, rows);
                if let Some(scrollback) = self.sessions.read_scrollback(session_id) {
                    let data = snapshot_tail(&scrollback, MAX_SNAPSHOT_BYTES);
                    self.send(
                        message_type::TERMINAL_SNAPSHOT,
                        client,
                        TerminalDataPayload { session_id, data },
                    );
                }
            }
            message_type::TERMINAL_INPUT => {
                if let Some(env) = decode_payload::<TerminalInputPayload>(text) {
                    self.terminal
                        .send_input(env.payload.session_id, &env.payload.text);
                }
            }
            message_type::TERMINAL_RESIZE => {
                if let Some(env) = decode_payload::<TerminalResizePayload>(text) {
                    let TerminalResizePayload {
                        session_id,
                        cols,
                        rows,
                    } = env.payload;
                    self.requested_sizes.insert(session_id, (cols, rows));
                    self.terminal.resize(session_id, cols, rows);
                }
            }
            message_type::TERMINAL_INTERRUPT => {
                if let Some(env) = decode_payload::<TerminalInterruptPayload>(text) {
                    self.terminal.interrupt(env.payload.session_id);
                }
            }
            message_type::CREATE_SESSION => {
                let Some(env) = decode_payload::<CreateSessionPayload>(text) else {
                    return;
                };
                let Some(session) = self.sessions.create_session(&env.payload) else {
                    warn!(name = %env.payload.name, "session provider declined create-session");
                    return;
                };
                self.send(
                    message_type::SESSION_CREATED,
                    client,
                    SessionPayload { session },
                );
                let list = self.session_list();
                for id in &self.active_clients {
                    self.send(message_type::SESSION_LIST, PeerId::client(id.clone()), &list);
                }
            }
            message_type::LIST_PROJECT_PATHS => {
                self.send(
                    message_type::PROJECT_PATHS_LIST,
                    client,
                    self.sessions.project_paths(),
                );
            }
            other => debug!(message_type = other, "ignoring client message"),
        }
    }

    fn answer_challenge(&mut self, nonce: &str) {
        self.set_state(HostState::Authenticating);
        let signature = sign_nonce(self.identity.as_ref(), nonce);
        self.send_to_relay(
            message_type::HOST_AUTH,
            SignedChallengePayload {
                nonce: nonce.to_string(),
                signature,
            },
        );
    }

    /// Ask the relay for a pairing QR, connecting first if needed.
    pub fn request_pairing(&mut self, now: Instant) {
        let Some(url) = self.options.relay_url.clone() else {
            self.set_pairing(PairingStatus::Failed(
                "No relay URL configured".to_string(),
            ));
            return;
        };

        self.pairing_deadline = Some(now + self.options.pairing_timeout);
        self.set_pairing(PairingStatus::Requested);
        if self.state == HostState::Authenticated {
            self.send_pairing_create();
            return;
        }

        self.pairing_pending = true;
        if self.state == HostState::Disconnected {
            self.set_state(HostState::Connecting);
            self.link.connect(&socket_url(&url, &self.me));
        }
    }

    /// Drop any pairing in progress and hide the QR.
    pub fn cancel_pairing(&mut self) {
        self.pairing_pending = false;
        self.pairing_deadline = None;
        self.set_pairing(PairingStatus::Idle);
    }

    /// Fail a pairing request that outlived its deadline.
    pub fn check_timeouts(&mut self, now: Instant) {
        let Some(deadline) = self.pairing_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        self.pairing_deadline = None;
        self.pairing_pending = false;
        if self.pairing == PairingStatus::Requested {
            let url = self.options.relay_url.clone().unwrap_or_default();
            warn!(%url, "pairing request timed out");
            self.set_pairing(PairingStatus::Failed(format!(
                "Timeout: could not reach relay at {url}"
            )));
        }
    }

    fn send_pairing_create(&mut self) {
        self.send_to_relay(
            message_type::PAIRING_CREATE,
            PairingCreatePayload {
                ttl_seconds: self.options.pairing_ttl,
            },
        );
    }

    fn on_pairing_created(&mut self, created: &PairingCreatedPayload) {
        if self.pairing != PairingStatus::Requested {
            debug!("pairing challenge arrived after cancel, ignoring");
            return;
        }
        let fallback = self.options.relay_url.clone().unwrap_or_default();
        let payload = PairingQrPayload::from_created(&self.options.host_id, &fallback, created);
        match payload.to_json() {
            Ok(qr_json) => {
                self.pairing_deadline = None;
                self.set_pairing(PairingStatus::Ready { qr_json, payload });
            }
            Err(e) => warn!(error = %e, "failed to encode pairing QR"),
        }
    }

    fn approve(&mut self, pending: PairingPendingApprovalPayload) {
        info!(
            client_id = %pending.client_id,
            device = %pending.device_name,
            "approving pairing request"
        );
        let signature = sign_nonce(self.identity.as_ref(), &pending.challenge_id);
        self.send_to_relay(
            message_type::PAIRING_APPROVE,
            PairingApprovePayload {
                client_id: pending.client_id.clone(),
                challenge_id: pending.challenge_id,
                signature,
            },
        );
        self.active_clients.insert(pending.client_id.clone());
        self.pairing_deadline = None;
        self.set_pairing(PairingStatus::Idle);
        let _ = self.updates.send(HostUpdate::ClientPaired {
            client_id: pending.client_id,
            device_name: pending.device_name,
        });
    }

    /// Fan terminal output out to every active client.
    pub fn publish_output(&self, session_id: Uuid, data: &[u8]) {
        if self.state != HostState::Authenticated {
            return;
        }
        let payload = TerminalDataPayload {
            session_id,
            data: String::from_utf8_lossy(data).into_owned(),
        };
        for id in &self.active_clients {
            self.send(message_type::TERMINAL_OUTPUT, PeerId::client(id.clone()), &payload);
        }
    }

    /// Tell every active client a session changed.
    pub fn publish_session_update(&self, session: SessionSummary) {
        if self.state != HostState::Authenticated {
            return;
        }
        let payload = SessionPayload { session };
        for id in &self.active_clients {
            self.send(message_type::SESSION_UPDATED, PeerId::client(id.clone()), &payload);
        }
    }

    /// Forget per-connection state after an explicit disconnect.
    pub fn on_local_disconnect(&mut self) {
        self.set_state(HostState::Disconnected);
        self.pairing_pending = false;
        self.pairing_deadline = None;
        self.active_clients.clear();
        if self.pairing != PairingStatus::Idle {
            self.set_pairing(PairingStatus::Idle);
        }
    }

    fn register_payload(&self) -> HostRegisterPayload {
        HostRegisterPayload {
            display_name: self.options.display_name.clone(),
            public_key: public_key_base64(self.identity.as_ref()),
            app_version: self.options.app_version.clone(),
            platform: self.options.platform.clone(),
        }
    }

    fn session_list(&self) -> SessionListPayload {
        SessionListPayload {
            sessions: self.sessions.list_sessions(),
        }
    }

    fn send<P: Serialize>(&self, kind: &str, target: PeerId, payload: P) -> bool {
        send_envelope(&self.link, kind, &self.me, target, payload)
    }

    fn send_to_relay<P: Serialize>(&self, kind: &str, payload: P) -> bool {
        self.send(kind, PeerId::relay(), payload)
    }

    fn set_state(&mut self, state: HostState) {
        if self.state != state {
            self.state = state;
            let _ = self.updates.send(HostUpdate::State(state));
        }
    }

    fn set_pairing(&mut self, status: PairingStatus) {
        self.pairing = status.clone();
        let _ = self.updates.send(HostUpdate::Pairing(status));
    }
}

/// Last `max` bytes of `scrollback`, starting on a UTF-8 boundary.
fn snapshot_tail(scrollback: &[u8], max: usize) -> String {
    let mut start = scrollback.len().saturating_sub(max);
    while start < scrollback.len() && (scrollback[start] & 0xC0) == 0x80 {
        start += 1;
    }
    String::from_utf8_lossy(&scrollback[start..]).into_owned()
}

/// Commands a host UI can send to [`run_host`].
#[derive(Debug)]
pub enum HostCommand {
    /// Start pairing a new client.
    RequestPairing,
    /// Abandon the current pairing.
    CancelPairing,
    /// Terminal output to mirror to clients.
    Output {
        /// Session that produced it.
        session_id: Uuid,
        /// Raw bytes.
        data: Vec<u8>,
    },
    /// A session's summary changed.
    SessionUpdated(SessionSummary),
    /// App came back to the foreground.
    Foreground,
    /// Disconnect and return.
    Shutdown,
}

/// Drive a host agent until [`HostCommand::Shutdown`] or the command channel closes.
pub async fn run_host(
    mut agent: HostAgent<Transport>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<HostCommand>,
) {
    agent.start();
    loop {
        let deadline = agent.next_deadline();
        tokio::select! {
            Some(event) = events.recv() => agent.handle_event(event),
            command = commands.recv() => match command {
                Some(HostCommand::RequestPairing) => agent.request_pairing(Instant::now()),
                Some(HostCommand::CancelPairing) => agent.cancel_pairing(),
                Some(HostCommand::Output { session_id, data }) => agent.publish_output(session_id, &data),
                Some(HostCommand::SessionUpdated(session)) => agent.publish_session_update(session),
                Some(HostCommand::Foreground) => agent.link().foreground(),
                Some(HostCommand::Shutdown) | None => break,
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                agent.check_timeouts(Instant::now());
            }
        }
    }
    agent.link().disconnect().await;
    agent.on_local_disconnect();
}
