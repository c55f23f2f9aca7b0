use crate::dispatch::{dispatch, Action, ConnectionContext};
use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms, LIVENESS_BODY};
use crate::registry::{ConnHandle, Outgoing};
use crate::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hub_common::path::parse_socket_path;
use hub_common::PeerId;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

const DELIVERY_QUEUE: usize = 256;
const PEEK_TIMEOUT: Duration = Duration::from_secs(5);

fn not_found() -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some("unknown socket path".to_string()));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

/// Queue `text` on another connection without waiting.
fn deliver(to: &ConnHandle, text: String) {
    match to.tx.try_send(Outgoing::Text(text)) {
        Ok(()) => counters::messages_forwarded_total(),
        Err(mpsc::error::TrySendError::Full(_)) => {
            counters::messages_dropped_total("backpressure");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            counters::messages_dropped_total("offline");
        }
    }
}

/// Whether the buffered request head is a plain `GET /` or `HEAD /` rather
/// than a WebSocket upgrade.
fn is_liveness_request(head: &[u8]) -> bool {
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    (head.starts_with("get / ") || head.starts_with("head / "))
        && !head.contains("upgrade: websocket")
}

/// Answer platform health checks hitting the public port.
///
/// Returns `true` if the request was answered and the socket is done.
async fn answer_liveness(stream: &mut TcpStream) -> Result<bool, RelayError> {
    let mut head = [0u8; 1024];
    let Ok(peeked) = tokio::time::timeout(PEEK_TIMEOUT, stream.peek(&mut head)).await else {
        return Ok(false);
    };
    let n = peeked?;
    if !is_liveness_request(&head[..n]) {
        return Ok(false);
    }
    stream.read_exact(&mut head[..n]).await?;
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{LIVENESS_BODY}",
        LIVENESS_BODY.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(true)
}

/// Outcome of handling one inbound frame.
enum Flow {
    Continue,
    Close,
}

async fn handle_text(
    text: &str,
    state: &ServerState,
    ctx: &mut ConnectionContext,
    ws_tx: &mut WsSink,
) -> Result<Flow, RelayError> {
    let start = Instant::now();
    let action = dispatch(state, ctx, text);
    histograms::dispatch_latency_seconds(start.elapsed().as_secs_f64());
    match action {
        Action::None => {}
        Action::Reply(reply) => ws_tx.send(Message::Text(reply)).await?,
        Action::Deliver { to, text } => deliver(&to, text),
        Action::Close => {
            let _ = ws_tx.send(Message::Close(None)).await;
            return Ok(Flow::Close);
        }
    }
    Ok(Flow::Continue)
}

/// Drive the read/deliver/ping loop for one socket.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    deliver_rx: &mut mpsc::Receiver<Outgoing>,
    state: &ServerState,
    ctx: &mut ConnectionContext,
    shutdown: &mut watch::Receiver<()>,
) -> Result<(), RelayError> {
    let mut ping_interval = interval(Duration::from_secs(state.config.ping_interval));
    let idle_timeout = Duration::from_secs(state.config.idle_timeout);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                let flow = match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&text, state, ctx, ws_tx).await?,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => handle_text(&text, state, ctx, ws_tx).await?,
                        Err(_) => {
                            counters::messages_dropped_total("malformed");
                            Flow::Continue
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send pong");
                        }
                        Flow::Continue
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    Some(Ok(_)) => Flow::Continue,
                };
                if matches!(flow, Flow::Close) {
                    return Ok(());
                }
            }
            Some(out) = deliver_rx.recv() => {
                last_activity = Instant::now();
                match out {
                    Outgoing::Text(text) => ws_tx.send(Message::Text(text)).await?,
                    Outgoing::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(peer = %ctx.peer, "relay shutting down, closing connection");
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(());
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(peer = %ctx.peer, "idle timeout reached, closing connection");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                    debug!(error = %e, "failed to send ping");
                }
            }
        }
    }
}

/// Accept one WebSocket, bind it to the peer named by its path, and serve it
/// until either side closes or `shutdown` fires.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), RelayError> {
    if answer_liveness(&mut stream).await? {
        return Ok(());
    }

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size),
        max_frame_size: Some(state.config.max_message_size),
        ..WebSocketConfig::default()
    };

    let requested = Arc::new(OnceLock::new());
    let requested_cell = Arc::clone(&requested);
    let ws_stream = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| match parse_socket_path(req.uri().path()) {
            Some(peer) => {
                let _ = requested_cell.set(peer);
                Ok(resp)
            }
            None => Err(not_found()),
        },
        Some(ws_config),
    )
    .await?;

    let peer: PeerId = requested.get().cloned().ok_or(RelayError::InvalidPath)?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (deliver_tx, mut deliver_rx) = mpsc::channel(DELIVERY_QUEUE);
    let conn_id = state.next_conn_id();
    let handle = ConnHandle {
        tx: deliver_tx,
        conn_id,
    };
    if state.registry.set_socket(peer.kind, &peer.id, handle).is_some() {
        debug!(peer = %peer, "newer connection replaced existing socket");
    }
    let role = peer.kind.as_str();
    gauges::inc_connections_active(role);
    info!(peer = %peer, %peer_addr, conn_id, "peer connected");

    let mut ctx = ConnectionContext::new(peer.clone());
    let result = run_message_loop(
        &mut ws_tx,
        &mut ws_rx,
        &mut deliver_rx,
        &state,
        &mut ctx,
        &mut shutdown,
    )
    .await;

    state.registry.remove_socket_if(peer.kind, &peer.id, conn_id);
    gauges::dec_connections_active(role);
    info!(peer = %peer, conn_id, authenticated = ctx.authenticated, "peer disconnected");

    result
}
