use thiserror::Error;

/// Why a relay link attempt ended.
#[derive(Error, Debug)]
pub enum PeerError {
    /// WebSocket protocol or I/O error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// The relay closed the socket.
    #[error("connection closed by relay")]
    ConnectionClosed,
    /// The relay never answered the initial liveness ping.
    #[error("liveness probe timed out")]
    ProbeTimeout,
    /// A keepalive ping went unanswered.
    #[error("keepalive ping timed out")]
    KeepaliveTimeout,
}
