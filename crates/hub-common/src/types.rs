//! Protocol constants for the hub relay wire format.

/// Envelope schema version carried in every `v` field.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifier the relay uses as the `id` of its own [`PeerId`](crate::PeerId).
pub const RELAY_ID: &str = "relay";

/// Default lifetime of an authentication challenge, in seconds.
pub const DEFAULT_CHALLENGE_TTL_SECS: u64 = 60;

/// TTL the host requests when it creates a pairing challenge, in seconds.
pub const DEFAULT_PAIRING_TTL_SECS: u64 = 120;

/// Upper bound on scrollback bytes returned in a terminal snapshot.
pub const MAX_SNAPSHOT_BYTES: usize = 128_000;

/// Number of random bytes behind every challenge nonce.
pub const NONCE_LEN: usize = 32;

/// Envelope `type` tags.
///
/// Types the relay interprets are listed first; everything else is
/// forwarded verbatim between an authenticated host and its clients.
pub mod message_type {
    /// Host announces its display name and public key.
    pub const HOST_REGISTER: &str = "host-register";
    /// Host asks for an authentication challenge.
    pub const HOST_HELLO: &str = "host-hello";
    /// Host answers a challenge with a signature.
    pub const HOST_AUTH: &str = "host-auth";
    /// Relay confirms host authentication.
    pub const HOST_AUTHENTICATED: &str = "host-authenticated";
    /// Relay issues a nonce to sign.
    pub const CHALLENGE: &str = "challenge";
    /// Paired client asks for a challenge against a host.
    pub const CLIENT_HELLO: &str = "client-hello";
    /// Client answers a challenge with a signature.
    pub const CLIENT_AUTH: &str = "client-auth";
    /// Relay confirms client authentication.
    pub const CLIENT_AUTHENTICATED: &str = "client-authenticated";
    /// Host asks for a one-time pairing challenge.
    pub const PAIRING_CREATE: &str = "pairing-create";
    /// Relay returns the pairing challenge to the host.
    pub const PAIRING_CREATED: &str = "pairing-created";
    /// Client presents a scanned pairing code.
    pub const PAIRING_REQUEST: &str = "pairing-request";
    /// Relay asks the host to approve a pairing request.
    pub const PAIRING_PENDING_APPROVAL: &str = "pairing-pending-approval";
    /// Host approves a pending pairing request.
    pub const PAIRING_APPROVE: &str = "pairing-approve";
    /// Relay tells the client it is now trusted by the host.
    pub const PAIRING_SUCCESS: &str = "pairing-success";

    /// Client asks for the host's sessions.
    pub const LIST_SESSIONS: &str = "list-sessions";
    /// Host replies with its sessions.
    pub const SESSION_LIST: &str = "session-list";
    /// Client attaches to a session.
    pub const OPEN_SESSION: &str = "open-session";
    /// Client keystrokes for a session.
    pub const TERMINAL_INPUT: &str = "terminal-input";
    /// Live terminal output from the host.
    pub const TERMINAL_OUTPUT: &str = "terminal-output";
    /// Scrollback sent when a session is opened.
    pub const TERMINAL_SNAPSHOT: &str = "terminal-snapshot";
    /// Client interrupts the running process.
    pub const TERMINAL_INTERRUPT: &str = "terminal-interrupt";
    /// Client viewport size changed.
    pub const TERMINAL_RESIZE: &str = "terminal-resize";
    /// Host pushes a changed session summary.
    pub const SESSION_UPDATED: &str = "session-updated";
    /// Client asks the host to start a session.
    pub const CREATE_SESSION: &str = "create-session";
    /// Host confirms a new session.
    pub const SESSION_CREATED: &str = "session-created";
    /// Client asks for recent project paths.
    pub const LIST_PROJECT_PATHS: &str = "list-project-paths";
    /// Host replies with recent project paths and groups.
    pub const PROJECT_PATHS_LIST: &str = "project-paths-list";
}
