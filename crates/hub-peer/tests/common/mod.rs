#![allow(dead_code)]

use hub_common::messages::{CreateSessionPayload, SessionSummary};
use hub_peer::services::{SessionProvider, TerminalSink};
use hub_peer::transport::TransportConfig;
use hub_relay::config::ServerConfig;
use hub_relay::ServerState;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

/// Start a relay on an ephemeral port and return its base URL.
pub async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let config = ServerConfig {
        listen: addr,
        public_url: format!("ws://{addr}"),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        challenge_ttl: 60,
        max_pairing_ttl: 600,
        ping_interval: 30,
        idle_timeout: 120,
        max_message_size: 1_048_576,
        sweep_interval: 60,
    };
    let state = Arc::new(ServerState::new(config));
    tokio::spawn(async move {
        if let Err(e) = hub_relay::run(listener, state).await {
            eprintln!("relay error in test: {e}");
        }
    });
    format!("ws://{addr}")
}

pub fn fast_transport() -> TransportConfig {
    TransportConfig {
        keepalive_interval: Duration::from_secs(25),
        ping_timeout: Duration::from_secs(2),
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(500),
        backoff_factor: 2.0,
    }
}

/// Wait until `rx` yields an update `pick` accepts.
pub async fn wait_for<U, T>(
    rx: &mut broadcast::Receiver<U>,
    mut pick: impl FnMut(&U) -> Option<T>,
) -> T
where
    U: Clone + std::fmt::Debug,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    if let Some(found) = pick(&update) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("update channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

/// In-memory session manager with a fixed scrollback per session.
pub struct FakeSessions {
    pub sessions: Mutex<Vec<SessionSummary>>,
    pub scrollback: Vec<u8>,
}

impl FakeSessions {
    pub fn with_session(name: &str, scrollback: &str) -> (Arc<Self>, Uuid) {
        let id = Uuid::new_v4();
        let sessions = Self {
            sessions: Mutex::new(vec![summary(id, name)]),
            scrollback: scrollback.as_bytes().to_vec(),
        };
        (Arc::new(sessions), id)
    }
}

pub fn summary(id: Uuid, name: &str) -> SessionSummary {
    SessionSummary {
        id,
        name: name.to_string(),
        status: "running".to_string(),
        group_id: None,
        last_preview: String::new(),
        has_unread: false,
    }
}

impl SessionProvider for FakeSessions {
    fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.lock().unwrap().clone()
    }

    fn read_scrollback(&self, session_id: Uuid) -> Option<Vec<u8>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.id == session_id)
            .then(|| self.scrollback.clone())
    }

    fn create_session(&self, request: &CreateSessionPayload) -> Option<SessionSummary> {
        let created = summary(Uuid::new_v4(), &request.name);
        self.sessions.lock().unwrap().push(created.clone());
        Some(created)
    }
}

/// Terminal sink that records input per session.
#[derive(Default)]
pub struct RecordingTerminal {
    pub input: Mutex<Vec<(Uuid, String)>>,
}

impl TerminalSink for RecordingTerminal {
    fn send_input(&self, session_id: Uuid, text: &str) {
        self.input.lock().unwrap().push((session_id, text.to_string()));
    }

    fn resize(&self, _session_id: Uuid, _cols: u16, _rows: u16) {}
}

impl RecordingTerminal {
    /// Poll until input for `session_id` shows up.
    pub async fn wait_for_input(&self, session_id: Uuid) -> String {
        tokio::time::timeout(WAIT, async {
            loop {
                let found = self
                    .input
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|(id, _)| *id == session_id)
                    .map(|(_, text)| text.clone());
                if let Some(text) = found {
                    return text;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for terminal input")
    }
}
