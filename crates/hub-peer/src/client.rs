//! Client half of the protocol: redeem a pairing code or reconnect to the
//! remembered host, answer the relay's challenge, then talk to the host.

use crate::credentials::{CredentialStore, PairedHostRecord};
use crate::transport::{RelayLink, Transport, TransportEvent};
use crate::wire::{decode_payload, send_envelope};
use chrono::Utc;
use hub_common::crypto::{public_key_base64, sign_nonce, SigningIdentity};
use hub_common::envelope;
use hub_common::messages::{
    ChallengePayload, ClientHelloPayload, CreateSessionPayload, EmptyPayload,
    OpenSessionPayload, PairingRequestPayload, PairingSuccessPayload, ProjectPathsListPayload,
    SessionListPayload, SessionPayload, SessionSummary, SignedChallengePayload,
    TerminalDataPayload, TerminalInputPayload, TerminalInterruptPayload, TerminalResizePayload,
};
use hub_common::pairing::PairingQrPayload;
use hub_common::path::socket_url;
use hub_common::types::message_type;
use hub_common::{PeerId, PeerKind};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Viewport used when the UI has not measured one yet.
pub const DEFAULT_COLS: u16 = 100;
/// See [`DEFAULT_COLS`].
pub const DEFAULT_ROWS: u16 = 28;

/// Where the client is in its bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No socket.
    Disconnected,
    /// Dialing the relay.
    Connecting,
    /// `pairing-request` sent, waiting for the host to approve.
    Pairing,
    /// Challenge-response in progress.
    Authenticating,
    /// Relay acknowledged the signature; host traffic flows.
    Authenticated,
}

/// Notifications for the client UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientUpdate {
    /// Bootstrap state changed.
    State(ClientState),
    /// Human readable status line.
    Status(String),
    /// Pairing finished and the host was remembered.
    Paired(PairedHostRecord),
    /// Pairing gave up.
    PairingFailed(String),
    /// Full session list from the host.
    SessionList(Vec<SessionSummary>),
    /// Scrollback for a freshly opened session.
    Snapshot {
        /// Session id.
        session_id: Uuid,
        /// Terminal contents.
        data: String,
    },
    /// Live terminal output.
    Output {
        /// Session id.
        session_id: Uuid,
        /// New output.
        data: String,
    },
    /// A session changed on the host.
    SessionUpdated(SessionSummary),
    /// A session this or another client asked for now exists.
    SessionCreated(SessionSummary),
    /// Recent project directories and groups.
    ProjectPaths(ProjectPathsListPayload),
}

#[derive(Debug, Clone)]
enum Mode {
    Idle,
    Pairing(PairingQrPayload),
    Returning(PairedHostRecord),
}

/// Client protocol state machine.
pub struct ClientAgent<L> {
    link: L,
    me: PeerId,
    device_name: String,
    identity: Arc<dyn SigningIdentity>,
    store: Arc<dyn CredentialStore>,
    pairing_timeout: Duration,
    state: ClientState,
    mode: Mode,
    pairing_deadline: Option<Instant>,
    updates: broadcast::Sender<ClientUpdate>,
}

impl<L: RelayLink> ClientAgent<L> {
    /// Build an idle agent for client `client_id`.
    pub fn new(
        link: L,
        client_id: impl Into<String>,
        device_name: impl Into<String>,
        identity: Arc<dyn SigningIdentity>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            link,
            me: PeerId::client(client_id),
            device_name: device_name.into(),
            identity,
            store,
            pairing_timeout: Duration::from_secs(15),
            state: ClientState::Disconnected,
            mode: Mode::Idle,
            pairing_deadline: None,
            updates,
        }
    }

    /// Override how long a pairing may wait for approval.
    #[must_use]
    pub fn with_pairing_timeout(mut self, timeout: Duration) -> Self {
        self.pairing_timeout = timeout;
        self
    }

    /// Receive UI notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientUpdate> {
        self.updates.subscribe()
    }

    /// Current bootstrap state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The host this client is paired with, if any.
    pub fn paired_host(&self) -> Option<PairedHostRecord> {
        match &self.mode {
            Mode::Returning(record) => Some(record.clone()),
            _ => self.store.paired_host(),
        }
    }

    /// When [`check_timeouts`](Self::check_timeouts) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pairing_deadline
    }

    /// The link this agent writes to.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Start pairing with the host that issued `qr`.
    ///
    /// Returns `false` without connecting if the code has already expired.
    pub fn pair(&mut self, qr: PairingQrPayload, now: Instant) -> bool {
        if qr.is_expired_at(Utc::now()) {
            self.emit(ClientUpdate::PairingFailed(
                "Pairing code expired".to_string(),
            ));
            return false;
        }
        info!(host_id = %qr.host_id, relay = %qr.relay_url, "pairing with host");
        let url = socket_url(&qr.relay_url, &self.me);
        self.mode = Mode::Pairing(qr);
        self.pairing_deadline = Some(now + self.pairing_timeout);
        self.set_state(ClientState::Connecting);
        self.link.connect(&url);
        true
    }

    /// Reconnect to the stored host. `false` if this device was never paired.
    pub fn reconnect_if_possible(&mut self) -> bool {
        let Some(record) = self.store.paired_host() else {
            return false;
        };
        let url = socket_url(&record.relay_url, &self.me);
        self.mode = Mode::Returning(record);
        self.set_state(ClientState::Connecting);
        self.link.connect(&url);
        true
    }

    /// Feed one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Message(text) => self.handle_message(&text),
            TransportEvent::Disconnected { reason } => {
                debug!(%reason, "client lost relay link");
                self.set_state(ClientState::Disconnected);
            }
        }
    }

    fn on_connected(&mut self) {
        match self.mode.clone() {
            Mode::Pairing(qr) => {
                self.set_state(ClientState::Pairing);
                self.emit(ClientUpdate::Status("Waiting for host approval".to_string()));
                self.send_to_relay(
                    message_type::PAIRING_REQUEST,
                    PairingRequestPayload {
                        host_id: qr.host_id,
                        challenge_id: qr.challenge_id,
                        nonce: qr.nonce,
                        device_name: self.device_name.clone(),
                        public_key: public_key_base64(self.identity.as_ref()),
                    },
                );
            }
            Mode::Returning(record) => self.send_hello(&record.host_id),
            Mode::Idle => debug!("connected with nothing to do"),
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

        if header.source.kind == PeerKind::Relay {
            self.handle_relay_message(&header.message_type, text);
            return;
        }

        let from_our_host = header.source.kind == PeerKind::Host
            && matches!(&self.mode, Mode::Returning(r) if r.host_id == header.source.id);
        if !from_our_host || self.state != ClientState::Authenticated {
            debug!(source = %header.source, message_type = %header.message_type, "ignoring message");
            return;
        }
        self.handle_host_message(&header.message_type, text);
    }

    fn handle_relay_message(&mut self, kind: &str, text: &str) {
        match kind {
            message_type::PAIRING_SUCCESS => {
                if let Some(env) = decode_payload::<PairingSuccessPayload>(text) {
                    self.on_paired(env.payload);
                }
            }
            message_type::CHALLENGE => {
                if let Some(env) = decode_payload::<ChallengePayload>(text) {
                    self.set_state(ClientState::Authenticating);
                    let signature = sign_nonce(self.identity.as_ref(), &env.payload.nonce);
                    self.send_to_relay(
                        message_type::CLIENT_AUTH,
                        SignedChallengePayload {
                            nonce: env.payload.nonce,
                            signature,
                        },
                    );
                }
            }
            message_type::CLIENT_AUTHENTICATED => {
                let Mode::Returning(record) = &self.mode else {
                    debug!("authenticated without a paired host, ignoring");
                    return;
                };
                let status = format!("Connected to {}", record.host_name);
                info!(host_id = %record.host_id, "authenticated with relay");
                self.set_state(ClientState::Authenticated);
                self.emit(ClientUpdate::Status(status));
                self.request_sessions();
            }
            other => debug!(message_type = other, "ignoring relay message"),
        }
    }

    fn on_paired(&mut self, success: PairingSuccessPayload) {
        let Mode::Pairing(qr) = &self.mode else {
            debug!("pairing-success without a pairing in progress");
            return;
        };
        if qr.host_id != success.host_id {
            warn!(expected = %qr.host_id, got = %success.host_id, "pairing-success for another host");
            return;
        }
        let record = PairedHostRecord {
            relay_url: qr.relay_url.clone(),
            host_id: success.host_id,
            host_name: success.host_name,
            host_public_key: success.host_public_key,
        };
        if let Err(e) = self.store.save_paired_host(&record) {
            warn!(error = %e, "failed to persist paired host");
        }
        info!(host_id = %record.host_id, host = %record.host_name, "paired with host");
        self.pairing_deadline = None;
        self.mode = Mode::Returning(record.clone());
        self.emit(ClientUpdate::Paired(record.clone()));
        self.send_hello(&record.host_id);
    }

    fn handle_host_message(&mut self, kind: &str, text: &str) {
        let update = match kind {
            message_type::SESSION_LIST => decode_payload::<SessionListPayload>(text)
                .map(|env| ClientUpdate::SessionList(env.payload.sessions)),
            message_type::TERMINAL_SNAPSHOT => {
                decode_payload::<TerminalDataPayload>(text).map(|env| ClientUpdate::Snapshot {
                    session_id: env.payload.session_id,
                    data: env.payload.data,
                })
            }
            message_type::TERMINAL_OUTPUT => {
                decode_payload::<TerminalDataPayload>(text).map(|env| ClientUpdate::Output {
                    session_id: env.payload.session_id,
                    data: env.payload.data,
                })
            }
            message_type::SESSION_UPDATED => decode_payload::<SessionPayload>(text)
                .map(|env| ClientUpdate::SessionUpdated(env.payload.session)),
            message_type::SESSION_CREATED => decode_payload::<SessionPayload>(text)
                .map(|env| ClientUpdate::SessionCreated(env.payload.session)),
            message_type::PROJECT_PATHS_LIST => decode_payload::<ProjectPathsListPayload>(text)
                .map(|env| ClientUpdate::ProjectPaths(env.payload)),
            other => {
                debug!(message_type = other, "ignoring host message");
                None
            }
        };
        if let Some(update) = update {
            self.emit(update);
        }
    }

    /// Give up on a pairing that was never approved.
    pub fn check_timeouts(&mut self, now: Instant) {
        match self.pairing_deadline {
            Some(deadline) if now >= deadline => {}
            _ => return,
        }
        self.pairing_deadline = None;
        if matches!(self.mode, Mode::Pairing(_)) {
            warn!("pairing was not approved in time");
            self.mode = Mode::Idle;
            self.link.close();
            self.set_state(ClientState::Disconnected);
            self.emit(ClientUpdate::PairingFailed(
                "Pairing timed out, scan the code again".to_string(),
            ));
        }
    }

    /// Ask the host for its sessions.
    pub fn request_sessions(&self) -> bool {
        self.send_to_host(message_type::LIST_SESSIONS, EmptyPayload::default())
    }

    /// Attach to a session; `None` sizes fall back to 100x28.
    pub fn open_session(&self, session_id: Uuid, cols: Option<u16>, rows: Option<u16>) -> bool {
        self.send_to_host(
            message_type::OPEN_SESSION,
            OpenSessionPayload {
                session_id,
                cols: cols.unwrap_or(DEFAULT_COLS),
                rows: rows.unwrap_or(DEFAULT_ROWS),
            },
        )
    }

    /// Type into a session.
    pub fn send_input(&self, session_id: Uuid, text: impl Into<String>) -> bool {
        self.send_to_host(
            message_type::TERMINAL_INPUT,
            TerminalInputPayload {
                session_id,
                text: text.into(),
            },
        )
    }

    /// Report a new viewport size.
    pub fn send_resize(&self, session_id: Uuid, cols: u16, rows: u16) -> bool {
        self.send_to_host(
            message_type::TERMINAL_RESIZE,
            TerminalResizePayload {
                session_id,
                cols,
                rows,
            },
        )
    }

    /// Ctrl-C.
    pub fn send_interrupt(&self, session_id: Uuid) -> bool {
        self.send_to_host(
            message_type::TERMINAL_INTERRUPT,
            TerminalInterruptPayload { session_id },
        )
    }

    /// Ask the host to spawn a session.
    pub fn create_session(&self, request: CreateSessionPayload) -> bool {
        self.send_to_host(message_type::CREATE_SESSION, request)
    }

    /// Ask for recent project directories.
    pub fn list_project_paths(&self) -> bool {
        self.send_to_host(message_type::LIST_PROJECT_PATHS, EmptyPayload::default())
    }

    /// Forget connection state after an explicit disconnect.
    pub fn on_local_disconnect(&mut self) {
        self.pairing_deadline = None;
        if matches!(self.mode, Mode::Pairing(_)) {
            self.mode = Mode::Idle;
        }
        self.set_state(ClientState::Disconnected);
    }

    fn send_hello(&mut self, host_id: &str) {
        self.set_state(ClientState::Authenticating);
        self.send_to_relay(
            message_type::CLIENT_HELLO,
            ClientHelloPayload {
                host_id: host_id.to_string(),
            },
        );
    }

    fn send_to_host<P: Serialize>(&self, kind: &str, payload: P) -> bool {
        if self.state != ClientState::Authenticated {
            return false;
        }
        let Mode::Returning(record) = &self.mode else {
            return false;
        };
        send_envelope(
            &self.link,
            kind,
            &self.me,
            PeerId::host(record.host_id.clone()),
            payload,
        )
    }

    fn send_to_relay<P: Serialize>(&self, kind: &str, payload: P) -> bool {
        send_envelope(&self.link, kind, &self.me, PeerId::relay(), payload)
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            self.state = state;
            self.emit(ClientUpdate::State(state));
        }
    }

    fn emit(&self, update: ClientUpdate) {
        let _ = self.updates.send(update);
    }
}

/// Commands a client UI can send to [`run_client`].
#[derive(Debug)]
pub enum ClientCommand {
    /// Redeem a scanned pairing code.
    Pair(PairingQrPayload),
    /// Reconnect to the stored host.
    Reconnect,
    /// Refresh the session list.
    ListSessions,
    /// Attach to a session.
    OpenSession {
        /// Session id.
        session_id: Uuid,
        /// Viewport columns.
        cols: Option<u16>,
        /// Viewport rows.
        rows: Option<u16>,
    },
    /// Type into a session.
    Input {
        /// Session id.
        session_id: Uuid,
        /// Text to send.
        text: String,
    },
    /// Viewport changed.
    Resize {
        /// Session id.
        session_id: Uuid,
        /// Columns.
        cols: u16,
        /// Rows.
        rows: u16,
    },
    /// Ctrl-C.
    Interrupt(Uuid),
    /// Spawn a session on the host.
    CreateSession(CreateSessionPayload),
    /// Fetch recent project directories.
    ListProjectPaths,
    /// App came back to the foreground.
    Foreground,
    /// Disconnect and return.
    Shutdown,
}

/// Drive a client agent until [`ClientCommand::Shutdown`] or the command channel closes.
pub async fn run_client(
    mut agent: ClientAgent<Transport>,
    mut events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<ClientCommand>,
) {
    loop {
        let deadline = agent.next_deadline();
        tokio::select! {
            Some(event) = events.recv() => agent.handle_event(event),
            command = commands.recv() => match command {
                Some(ClientCommand::Pair(qr)) => {
                    agent.pair(qr, Instant::now());
                }
                Some(ClientCommand::Reconnect) => {
                    if !agent.reconnect_if_possible() {
                        warn!("no paired host to reconnect to");
                    }
                }
                Some(ClientCommand::ListSessions) => {
                    agent.request_sessions();
                }
                Some(ClientCommand::OpenSession { session_id, cols, rows }) => {
                    agent.open_session(session_id, cols, rows);
                }
                Some(ClientCommand::Input { session_id, text }) => {
                    agent.send_input(session_id, text);
                }
                Some(ClientCommand::Resize { session_id, cols, rows }) => {
                    agent.send_resize(session_id, cols, rows);
                }
                Some(ClientCommand::Interrupt(session_id)) => {
                    agent.send_interrupt(session_id);
                }
                Some(ClientCommand::CreateSession(request)) => {
                    agent.create_session(request);
                }
                Some(ClientCommand::ListProjectPaths) => {
                    agent.list_project_paths();
                }
                Some(ClientCommand::Foreground) => agent.link().foreground(),
                Some(ClientCommand::Shutdown) | None => break,
            },
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                agent.check_timeouts(Instant::now());
            }
        }
    }
    agent.link().disconnect().await;
    agent.on_local_disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::wire::testing::RecordingLink;
    use ed25519_dalek::SigningKey;
    use hub_common::crypto::verify_nonce;
    use hub_common::envelope::Envelope;
    use hub_common::messages::AuthenticatedPayload;

    struct Fixture {
        agent: ClientAgent<Arc<RecordingLink>>,
        link: Arc<RecordingLink>,
        store: Arc<MemoryCredentialStore>,
        key: Arc<SigningKey>,
        updates: broadcast::Receiver<ClientUpdate>,
    }

    fn fixture() -> Fixture {
        let link = Arc::new(RecordingLink::default());
        let store = Arc::new(MemoryCredentialStore::default());
        let key = Arc::new(SigningKey::from_bytes(&[3u8; 32]));
        let agent = ClientAgent::new(
            Arc::clone(&link),
            "cl1",
            "iPhone",
            key.clone(),
            store.clone(),
        );
        let updates = agent.subscribe();
        Fixture {
            agent,
            link,
            store,
            key,
            updates,
        }
    }

    fn drain(updates: &mut broadcast::Receiver<ClientUpdate>) -> Vec<ClientUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = updates.try_recv() {
            out.push(update);
        }
        out
    }

    fn qr(expires_in: chrono::Duration) -> PairingQrPayload {
        PairingQrPayload {
            v: 1,
            relay_url: "wss://relay.example".to_string(),
            host_id: "h1".to_string(),
            challenge_id: "c1".to_string(),
            nonce: "n1".to_string(),
            expires_at: Utc::now() + expires_in,
        }
    }

    fn record() -> PairedHostRecord {
        PairedHostRecord {
            relay_url: "wss://relay.example".to_string(),
            host_id: "h1".to_string(),
            host_name: "Mac-Mini".to_string(),
            host_public_key: "pk".to_string(),
        }
    }

    fn from_relay<P: Serialize>(kind: &str, payload: P) -> TransportEvent {
        TransportEvent::Message(
            envelope::encode(kind, PeerId::relay(), PeerId::client("cl1"), payload).unwrap(),
        )
    }

    fn from_host<P: Serialize>(host: &str, kind: &str, payload: P) -> TransportEvent {
        TransportEvent::Message(
            envelope::encode(kind, PeerId::host(host), PeerId::client("cl1"), payload).unwrap(),
        )
    }

    fn authenticated() -> TransportEvent {
        from_relay(
            message_type::CLIENT_AUTHENTICATED,
            AuthenticatedPayload {
                authenticated_at: Utc::now(),
            },
        )
    }

    fn returning_and_authenticated() -> Fixture {
        let mut f = fixture();
        f.store.save_paired_host(&record()).unwrap();
        assert!(f.agent.reconnect_if_possible());
        f.agent.handle_event(TransportEvent::Connected);
        f.agent.handle_event(authenticated());
        f.link.take();
        drain(&mut f.updates);
        f
    }

    fn summary(name: &str) -> SessionSummary {
        SessionSummary {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: "running".to_string(),
            group_id: None,
            last_preview: String::new(),
            has_unread: false,
        }
    }

    #[test]
    fn pairing_sends_request_with_device_key() {
        let mut f = fixture();
        assert!(f.agent.pair(qr(chrono::Duration::seconds(60)), Instant::now()));
        assert_eq!(
            *f.link.dialed.lock().unwrap(),
            vec!["wss://relay.example/ws/client/cl1"]
        );
        assert_eq!(f.agent.state(), ClientState::Connecting);

        f.agent.handle_event(TransportEvent::Connected);
        let request: Envelope<PairingRequestPayload> =
            f.link.take_one(message_type::PAIRING_REQUEST);
        assert_eq!(request.target, PeerId::relay());
        assert_eq!(request.source, PeerId::client("cl1"));
        assert_eq!(request.payload.host_id, "h1");
        assert_eq!(request.payload.challenge_id, "c1");
        assert_eq!(request.payload.nonce, "n1");
        assert_eq!(request.payload.device_name, "iPhone");
        assert_eq!(request.payload.public_key, public_key_base64(f.key.as_ref()));
        assert_eq!(f.agent.state(), ClientState::Pairing);
    }

    #[test]
    fn expired_code_is_rejected_without_dialing() {
        let mut f = fixture();
        assert!(!f.agent.pair(qr(chrono::Duration::seconds(-1)), Instant::now()));
        assert!(f.link.dialed.lock().unwrap().is_empty());
        assert!(drain(&mut f.updates)
            .iter()
            .any(|u| matches!(u, ClientUpdate::PairingFailed(_))));
    }

    #[test]
    fn pairing_success_persists_host_and_says_hello() {
        let mut f = fixture();
        f.agent.pair(qr(chrono::Duration::seconds(60)), Instant::now());
        f.agent.handle_event(TransportEvent::Connected);
        f.link.take();

        f.agent.handle_event(from_relay(
            message_type::PAIRING_SUCCESS,
            PairingSuccessPayload {
                host_id: "h1".to_string(),
                host_name: "Mac-Mini".to_string(),
                host_public_key: "pk".to_string(),
            },
        ));

        assert_eq!(f.store.paired_host(), Some(record()));
        let hello: Envelope<ClientHelloPayload> = f.link.take_one(message_type::CLIENT_HELLO);
        assert_eq!(hello.payload.host_id, "h1");
        assert_eq!(f.agent.state(), ClientState::Authenticating);
        assert_eq!(f.agent.next_deadline(), None);
        assert!(drain(&mut f.updates).contains(&ClientUpdate::Paired(record())));
    }

    #[test]
    fn pairing_success_for_another_host_is_ignored() {
        let mut f = fixture();
        f.agent.pair(qr(chrono::Duration::seconds(60)), Instant::now());
        f.agent.handle_event(TransportEvent::Connected);
        f.link.take();
        f.agent.handle_event(from_relay(
            message_type::PAIRING_SUCCESS,
            PairingSuccessPayload {
                host_id: "h2".to_string(),
                host_name: "Other".to_string(),
                host_public_key: "pk".to_string(),
            },
        ));
        assert!(f.store.paired_host().is_none());
        assert!(f.link.take().is_empty());
    }

    #[test]
    fn pairing_times_out() {
        let mut f = fixture();
        let now = Instant::now();
        f.agent.pair(qr(chrono::Duration::seconds(60)), now);
        f.agent.check_timeouts(now + Duration::from_secs(10));
        assert!(!drain(&mut f.updates)
            .iter()
            .any(|u| matches!(u, ClientUpdate::PairingFailed(_))));

        f.agent.check_timeouts(now + Duration::from_secs(15));
        assert!(drain(&mut f.updates)
            .iter()
            .any(|u| matches!(u, ClientUpdate::PairingFailed(_))));
        assert_eq!(f.agent.next_deadline(), None);
    }

    #[test]
    fn timed_out_pairing_closes_link_and_goes_idle() {
        let mut f = fixture();
        let now = Instant::now();
        f.agent.pair(qr(chrono::Duration::seconds(60)), now);
        f.agent.handle_event(TransportEvent::Connected);
        assert_eq!(f.agent.state(), ClientState::Pairing);
        f.link.take();

        f.agent.check_timeouts(now + Duration::from_secs(15));
        assert_eq!(f.agent.state(), ClientState::Disconnected);
        assert_eq!(*f.link.closed.lock().unwrap(), 1);
        assert!(drain(&mut f.updates)
            .contains(&ClientUpdate::State(ClientState::Disconnected)));

        let dialed = f.link.dialed.lock().unwrap().len();
        f.agent.check_timeouts(now + Duration::from_secs(30));
        f.agent.handle_event(TransportEvent::Disconnected {
            reason: "closed".to_string(),
        });
        assert_eq!(f.link.dialed.lock().unwrap().len(), dialed);
        assert!(f.link.take().is_empty());
        assert_eq!(*f.link.closed.lock().unwrap(), 1);

        f.agent.pair(qr(chrono::Duration::seconds(60)), now);
        assert_eq!(f.link.dialed.lock().unwrap().len(), dialed + 1);
    }

    #[test]
    fn returning_device_says_hello_and_signs_challenge() {
        let mut f = fixture();
        f.store.save_paired_host(&record()).unwrap();
        assert!(f.agent.reconnect_if_possible());
        f.agent.handle_event(TransportEvent::Connected);
        let hello: Envelope<ClientHelloPayload> = f.link.take_one(message_type::CLIENT_HELLO);
        assert_eq!(hello.payload.host_id, "h1");

        f.agent.handle_event(from_relay(
            message_type::CHALLENGE,
            ChallengePayload {
                nonce: "abc".to_string(),
                expires_at: Utc::now(),
            },
        ));
        let auth: Envelope<SignedChallengePayload> = f.link.take_one(message_type::CLIENT_AUTH);
        let pk = public_key_base64(f.key.as_ref());
        assert!(verify_nonce(&pk, "abc", &auth.payload.signature));
        assert_eq!(f.agent.state(), ClientState::Authenticating);
    }

    #[test]
    fn unpaired_device_cannot_reconnect() {
        let mut f = fixture();
        assert!(!f.agent.reconnect_if_possible());
        assert!(f.link.dialed.lock().unwrap().is_empty());
    }

    #[test]
    fn authenticated_ack_requests_sessions() {
        let mut f = fixture();
        f.store.save_paired_host(&record()).unwrap();
        f.agent.reconnect_if_possible();
        f.agent.handle_event(TransportEvent::Connected);
        f.link.take();

        assert!(!f.agent.request_sessions());
        f.agent.handle_event(authenticated());
        assert_eq!(f.agent.state(), ClientState::Authenticated);
        let list: Envelope<EmptyPayload> = f.link.take_one(message_type::LIST_SESSIONS);
        assert_eq!(list.target, PeerId::host("h1"));
        assert!(drain(&mut f.updates)
            .contains(&ClientUpdate::Status("Connected to Mac-Mini".to_string())));
    }

    #[test]
    fn open_session_defaults_viewport() {
        let f = returning_and_authenticated();
        let session_id = Uuid::new_v4();
        assert!(f.agent.open_session(session_id, None, None));
        let open: Envelope<OpenSessionPayload> = f.link.take_one(message_type::OPEN_SESSION);
        assert_eq!(
            (open.payload.session_id, open.payload.cols, open.payload.rows),
            (session_id, 100, 28)
        );
    }

    #[test]
    fn terminal_commands_address_the_host() {
        let f = returning_and_authenticated();
        let session_id = Uuid::new_v4();
        assert!(f.agent.send_input(session_id, "ls\n"));
        assert!(f.agent.send_resize(session_id, 120, 40));
        assert!(f.agent.send_interrupt(session_id));
        assert!(f.agent.list_project_paths());
        assert!(f.agent.create_session(CreateSessionPayload {
            name: "api".to_string(),
            project_path: "/src/api".to_string(),
            command: "claude".to_string(),
            flags: String::new(),
            group_id: None,
            use_worktree: false,
            initial_prompt: None,
        }));

        let headers = f.link.take_headers();
        let kinds: Vec<&str> = headers.iter().map(|h| h.message_type.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                message_type::TERMINAL_INPUT,
                message_type::TERMINAL_RESIZE,
                message_type::TERMINAL_INTERRUPT,
                message_type::LIST_PROJECT_PATHS,
                message_type::CREATE_SESSION,
            ]
        );
        assert!(headers.iter().all(|h| h.target == PeerId::host("h1")));
    }

    #[test]
    fn host_traffic_becomes_updates() {
        let mut f = returning_and_authenticated();
        let session = summary("build");
        f.agent.handle_event(from_host(
            "h1",
            message_type::SESSION_LIST,
            SessionListPayload {
                sessions: vec![session.clone()],
            },
        ));
        f.agent.handle_event(from_host(
            "h1",
            message_type::TERMINAL_OUTPUT,
            TerminalDataPayload {
                session_id: session.id,
                data: "hello".to_string(),
            },
        ));
        f.agent.handle_event(from_host(
            "h1",
            message_type::SESSION_CREATED,
            SessionPayload {
                session: session.clone(),
            },
        ));

        assert_eq!(
            drain(&mut f.updates),
            vec![
                ClientUpdate::SessionList(vec![session.clone()]),
                ClientUpdate::Output {
                    session_id: session.id,
                    data: "hello".to_string()
                },
                ClientUpdate::SessionCreated(session),
            ]
        );
    }

    #[test]
    fn traffic_from_other_hosts_is_ignored() {
        let mut f = returning_and_authenticated();
        f.agent.handle_event(from_host(
            "h2",
            message_type::SESSION_LIST,
            SessionListPayload::default(),
        ));
        assert!(drain(&mut f.updates).is_empty());
    }

    #[test]
    fn relay_drop_blocks_host_traffic_until_reauthenticated() {
        let mut f = returning_and_authenticated();
        f.agent.handle_event(TransportEvent::Disconnected {
            reason: "closed".into(),
        });
        assert_eq!(f.agent.state(), ClientState::Disconnected);
        assert!(!f.agent.request_sessions());

        f.agent.handle_event(TransportEvent::Connected);
        let _: Envelope<ClientHelloPayload> = f.link.take_one(message_type::CLIENT_HELLO);
    }
}
