//! Payload bodies for the message catalog.
//!
//! Field names are `snake_case` on the wire. Timestamps use the same
//! RFC 3339 encoding as the envelope itself.

use crate::envelope::iso8601;
use crate::types::DEFAULT_CHALLENGE_TTL_SECS;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload for messages that carry no data, such as `host-hello`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyPayload {}

/// `host-register`: the host's public identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRegisterPayload {
    /// Human readable machine name.
    pub display_name: String,
    /// Base64 Ed25519 public key.
    pub public_key: String,
    /// Host application version.
    pub app_version: String,
    /// Host operating system.
    pub platform: String,
}

/// `challenge`: a nonce the peer must sign before `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePayload {
    /// Base64 random nonce.
    pub nonce: String,
    /// Deadline for the signed answer.
    #[serde(with = "iso8601")]
    pub expires_at: DateTime<Utc>,
}

/// `host-auth` / `client-auth`: signature over a challenge nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedChallengePayload {
    /// The nonce exactly as received.
    pub nonce: String,
    /// Base64 Ed25519 signature over the nonce's UTF-8 bytes.
    pub signature: String,
}

/// `host-authenticated` / `client-authenticated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedPayload {
    /// When the relay accepted the signature.
    #[serde(with = "iso8601")]
    pub authenticated_at: DateTime<Utc>,
}

/// `client-hello`: which host the client wants to reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHelloPayload {
    /// Target host id.
    pub host_id: String,
}

/// `pairing-create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCreatePayload {
    /// Requested lifetime of the pairing code; the relay clamps it.
    #[serde(default = "default_pairing_ttl")]
    pub ttl_seconds: u64,
}

const fn default_pairing_ttl() -> u64 {
    DEFAULT_CHALLENGE_TTL_SECS
}

/// `pairing-created`: material the host renders as a pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCreatedPayload {
    /// One-time challenge id.
    pub challenge_id: String,
    /// Nonce the client must echo.
    pub nonce: String,
    /// When the code stops working.
    #[serde(with = "iso8601")]
    pub expires_at: DateTime<Utc>,
    /// Public URL of the relay that issued the code.
    pub relay_url: String,
}

/// `pairing-request`: the client presents a scanned pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRequestPayload {
    /// Host the code was issued for.
    pub host_id: String,
    /// Challenge id from the code.
    pub challenge_id: String,
    /// Nonce from the code.
    pub nonce: String,
    /// Human readable device name.
    pub device_name: String,
    /// Base64 Ed25519 public key of the device.
    pub public_key: String,
}

/// `pairing-pending-approval`: forwarded to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPendingApprovalPayload {
    /// Requesting client.
    pub client_id: String,
    /// Device name the client reported.
    pub device_name: String,
    /// Client public key that will enter the trust ledger.
    pub public_key: String,
    /// Challenge the request answers.
    pub challenge_id: String,
}

/// `pairing-approve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingApprovePayload {
    /// Client being approved.
    pub client_id: String,
    /// Challenge the approval refers to.
    pub challenge_id: String,
    /// Host signature over the challenge id.
    pub signature: String,
}

/// `pairing-success`: identity of the host the client is now paired with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingSuccessPayload {
    /// Host id.
    pub host_id: String,
    /// Host display name.
    pub host_name: String,
    /// Base64 Ed25519 public key of the host.
    pub host_public_key: String,
}

/// One terminal session as shown in the client's session list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Free-form status such as `running` or `idle`.
    pub status: String,
    /// Group the session belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    /// Last line of output.
    #[serde(default)]
    pub last_preview: String,
    /// Output arrived since the client last looked.
    #[serde(default)]
    pub has_unread: bool,
}

/// `session-list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionListPayload {
    /// All sessions on the host.
    pub sessions: Vec<SessionSummary>,
}

/// `open-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenSessionPayload {
    /// Session to attach to.
    pub session_id: Uuid,
    /// Viewport columns.
    pub cols: u16,
    /// Viewport rows.
    pub rows: u16,
}

/// `terminal-snapshot` and `terminal-output`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalDataPayload {
    /// Session the bytes belong to.
    pub session_id: Uuid,
    /// Terminal output, lossily decoded as UTF-8.
    pub data: String,
}

/// `terminal-input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInputPayload {
    /// Target session.
    pub session_id: Uuid,
    /// Text to type.
    pub text: String,
}

/// `terminal-interrupt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInterruptPayload {
    /// Target session.
    pub session_id: Uuid,
}

/// `terminal-resize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResizePayload {
    /// Target session.
    pub session_id: Uuid,
    /// New column count.
    pub cols: u16,
    /// New row count.
    pub rows: u16,
}

/// `session-updated` and `session-created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    /// The changed or new session.
    pub session: SessionSummary,
}

/// `create-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionPayload {
    /// Session name.
    pub name: String,
    /// Working directory.
    pub project_path: String,
    /// Program to launch.
    #[serde(default = "default_command")]
    pub command: String,
    /// Extra command-line flags.
    #[serde(default)]
    pub flags: String,
    /// Group to file the session under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    /// Run inside a fresh worktree.
    #[serde(default)]
    pub use_worktree: bool,
    /// Text typed into the session once it starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
}

fn default_command() -> String {
    "claude".to_string()
}

/// A recently used project directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentProjectPath {
    /// Entry id.
    pub id: Uuid,
    /// Absolute path.
    pub path: String,
    /// Short display name.
    pub name: String,
    /// Whether the directory is a git checkout.
    pub is_git_repo: bool,
}

/// A named session group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGroupSummary {
    /// Group id.
    pub id: Uuid,
    /// Group name.
    pub name: String,
}

/// `project-paths-list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectPathsListPayload {
    /// Recent project directories, newest first.
    pub recent_paths: Vec<RecentProjectPath>,
    /// Session groups.
    pub groups: Vec<SessionGroupSummary>,
}
