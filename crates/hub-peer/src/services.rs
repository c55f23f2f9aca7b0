//! Seams to the host's local session manager and terminal I/O.

use hub_common::messages::{CreateSessionPayload, ProjectPathsListPayload, SessionSummary};
use uuid::Uuid;

/// Read side of the host's session manager.
pub trait SessionProvider: Send + Sync {
    /// Summaries of every live session, in display order.
    fn list_sessions(&self) -> Vec<SessionSummary>;

    /// Raw scrollback for a session, oldest byte first.
    fn read_scrollback(&self, _session_id: Uuid) -> Option<Vec<u8>> {
        None
    }

    /// Spawn a session; `None` if the request could not be honoured.
    fn create_session(&self, _request: &CreateSessionPayload) -> Option<SessionSummary> {
        None
    }

    /// Recently used project directories and session groups.
    fn project_paths(&self) -> ProjectPathsListPayload {
        ProjectPathsListPayload::default()
    }
}

/// Write side of the host's terminals.
pub trait TerminalSink: Send + Sync {
    /// Type `text` into the session.
    fn send_input(&self, session_id: Uuid, text: &str);

    /// Resize the session's pseudo-terminal.
    fn resize(&self, session_id: Uuid, cols: u16, rows: u16);

    /// Deliver an interrupt (Ctrl-C).
    fn interrupt(&self, session_id: Uuid) {
        self.send_input(session_id, "\u{3}");
    }
}
