//! Reconnecting relay link shared by the host and client roles.
//!
//! A [`Transport`] owns at most one live socket. Every connect attempt bumps a
//! generation counter and each task spawned for that attempt carries the
//! generation it was started with; results from a superseded attempt are
//! discarded instead of touching the newer one.

use crate::backoff::ExponentialBackoff;
use crate::config::PeerConfig;
use crate::error::PeerError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 256;
const OUTBOUND_QUEUE: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Connection status of the relay link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// No socket and no attempt in progress.
    Disconnected,
    /// Socket opening or liveness probe pending.
    Connecting,
    /// Probe answered; frames flow both ways.
    Connected,
}

/// What the link reports to the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A new socket passed its liveness probe.
    Connected,
    /// A text frame from the relay.
    Message(String),
    /// The live socket went away; a reconnect has been scheduled.
    Disconnected {
        /// Human readable cause.
        reason: String,
    },
}

/// Timing parameters for the link.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Period between keepalive pings once connected.
    pub keepalive_interval: Duration,
    /// How long a ping (probe or keepalive) may go unanswered.
    pub ping_timeout: Duration,
    /// First reconnect delay.
    pub initial_delay: Duration,
    /// Reconnect delay cap.
    pub max_delay: Duration,
    /// Growth factor between reconnect delays.
    pub backoff_factor: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(10),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl From<&PeerConfig> for TransportConfig {
    fn from(config: &PeerConfig) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(config.keepalive.interval_s),
            ping_timeout: Duration::from_secs(config.keepalive.ping_timeout_s),
            initial_delay: Duration::from_millis(config.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
            backoff_factor: config.reconnect.backoff_factor,
        }
    }
}

/// Attempt bookkeeping, kept free of I/O so the generation rules can be
/// exercised directly.
#[derive(Debug)]
pub(crate) struct LinkState {
    generation: u64,
    status: LinkStatus,
    backoff: ExponentialBackoff,
    url: Option<String>,
}

impl LinkState {
    pub(crate) fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            generation: 0,
            status: LinkStatus::Disconnected,
            backoff,
            url: None,
        }
    }

    pub(crate) fn begin_attempt(&mut self, url: String) -> u64 {
        self.generation += 1;
        self.status = LinkStatus::Connecting;
        self.url = Some(url);
        self.generation
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Mark the link connected if `generation` is still the live attempt.
    pub(crate) fn on_probe_succeeded(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        self.status = LinkStatus::Connected;
        self.backoff.reset();
        true
    }

    /// Record a failed or lost attempt and return the delay before the next one.
    pub(crate) fn on_failure(&mut self, generation: u64) -> Option<Duration> {
        if !self.is_current(generation) || self.url.is_none() {
            return None;
        }
        self.status = LinkStatus::Disconnected;
        Some(self.backoff.next_delay())
    }

    /// Orphan every in-flight attempt and forget the target.
    pub(crate) fn invalidate(&mut self) {
        self.generation += 1;
        self.status = LinkStatus::Disconnected;
        self.url = None;
    }
}

#[derive(Default)]
struct Tasks {
    connection: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    outbound: Option<mpsc::Sender<String>>,
}

struct Inner {
    config: TransportConfig,
    link: Mutex<LinkState>,
    tasks: Mutex<Tasks>,
    events: mpsc::Sender<TransportEvent>,
    status: watch::Sender<LinkStatus>,
}

/// Lock order is always `tasks` then `link`.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Anything the protocol agents can push frames through.
pub trait RelayLink: Send + Sync {
    /// Start (or restart) the link towards `url`.
    fn connect(&self, url: &str);
    /// Queue a text frame; `false` when no socket is connected.
    fn send_text(&self, text: String) -> bool;
    /// Stop the link and any pending reconnect without waiting for the socket.
    fn close(&self);
}

impl<T: RelayLink + ?Sized> RelayLink for Arc<T> {
    fn connect(&self, url: &str) {
        (**self).connect(url);
    }

    fn send_text(&self, text: String) -> bool {
        (**self).send_text(text)
    }

    fn close(&self) {
        (**self).close();
    }
}

/// Handle to the reconnecting relay link. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("status", &*self.inner.status.borrow())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Create an idle transport and the receiver for its events.
    #[must_use]
    pub fn new(config: TransportConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (status, _) = watch::channel(LinkStatus::Disconnected);
        let backoff =
            ExponentialBackoff::new(config.initial_delay, config.max_delay, config.backoff_factor);
        let inner = Inner {
            config,
            link: Mutex::new(LinkState::new(backoff)),
            tasks: Mutex::new(Tasks::default()),
            events,
            status,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Cancel any pending reconnect, reset the backoff and dial `url`.
    pub fn connect(&self, url: &str) {
        let mut tasks = lock(&self.inner.tasks);
        if let Some(pending) = tasks.reconnect.take() {
            pending.abort();
        }
        lock(&self.inner.link).backoff.reset();
        start_attempt(&self.inner, &mut tasks, url.to_string());
    }

    /// App returned to the foreground: retry right away if not connected.
    pub fn foreground(&self) {
        let url = {
            let link = lock(&self.inner.link);
            if link.status == LinkStatus::Connected {
                return;
            }
            link.url.clone()
        };
        if let Some(url) = url {
            self.connect(&url);
        }
    }

    /// Queue a text frame on the live socket.
    pub fn send(&self, text: String) -> bool {
        let tasks = lock(&self.inner.tasks);
        match &tasks.outbound {
            Some(tx) => tx.try_send(text).is_ok(),
            None => false,
        }
    }

    /// Tear the link down and stop reconnecting.
    ///
    /// The reconnect task and keepalive are cancelled before the socket is
    /// closed.
    pub async fn disconnect(&self) {
        let (connection, graceful) = self.stop();
        if let Some(mut handle) = connection {
            if !graceful || tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.inner.status.send_replace(LinkStatus::Disconnected);
        info!("relay link closed");
    }

    /// Like [`disconnect`](Self::disconnect) but leaves the socket task to
    /// send its Close frame in the background.
    pub fn close(&self) {
        let (connection, graceful) = self.stop();
        if !graceful {
            if let Some(handle) = connection {
                handle.abort();
            }
        }
        self.inner.status.send_replace(LinkStatus::Disconnected);
        info!("relay link closed");
    }

    /// Invalidate the current attempt. Returns the socket task and whether
    /// it was live, so dropping its outbound queue makes it close.
    fn stop(&self) -> (Option<JoinHandle<()>>, bool) {
        let mut tasks = lock(&self.inner.tasks);
        if let Some(pending) = tasks.reconnect.take() {
            pending.abort();
        }
        lock(&self.inner.link).invalidate();
        let graceful = tasks.outbound.take().is_some();
        (tasks.connection.take(), graceful)
    }

    /// Current link status.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    /// Watch status transitions.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }
}

impl RelayLink for Transport {
    fn connect(&self, url: &str) {
        Transport::connect(self, url);
    }

    fn send_text(&self, text: String) -> bool {
        self.send(text)
    }

    fn close(&self) {
        Transport::close(self);
    }
}

fn start_attempt(inner: &Arc<Inner>, tasks: &mut Tasks, url: String) {
    if let Some(previous) = tasks.connection.take() {
        previous.abort();
    }
    tasks.outbound = None;
    let generation = lock(&inner.link).begin_attempt(url.clone());
    inner.status.send_replace(LinkStatus::Connecting);
    debug!(generation, %url, "dialing relay");
    tasks.connection = Some(tokio::spawn(run_connection(
        Arc::clone(inner),
        generation,
        url,
    )));
}

async fn run_connection(inner: Arc<Inner>, generation: u64, url: String) {
    let reason = match drive(&inner, generation, &url).await {
        Ok(()) => "connection closed".to_string(),
        Err(e) => e.to_string(),
    };

    let delay = {
        let mut tasks = lock(&inner.tasks);
        let mut link = lock(&inner.link);
        let Some(delay) = link.on_failure(generation) else {
            return;
        };
        drop(link);
        tasks.outbound = None;
        let retry = Arc::clone(&inner);
        let url = url.clone();
        tasks.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut tasks = lock(&retry.tasks);
            tasks.reconnect = None;
            if lock(&retry.link).is_current(generation) {
                start_attempt(&retry, &mut tasks, url);
            }
        }));
        // Under the tasks lock, like start_attempt's Connecting.
        inner.status.send_replace(LinkStatus::Disconnected);
        delay
    };

    warn!(
        %reason,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "relay link lost, reconnecting"
    );
    let _ = inner
        .events
        .send(TransportEvent::Disconnected { reason })
        .await;
}

async fn emit(inner: &Inner, generation: u64, event: TransportEvent) {
    if !lock(&inner.link).is_current(generation) {
        return;
    }
    if inner.events.send(event).await.is_err() {
        debug!("transport event dropped: receiver gone");
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping once and wait for the matching pong.
async fn probe(
    ws_tx: &mut SplitSink<WsStream, Message>,
    ws_rx: &mut SplitStream<WsStream>,
    early: &mut Vec<String>,
) -> Result<(), PeerError> {
    ws_tx.send(Message::Ping(b"probe".to_vec())).await?;
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Pong(_))) => return Ok(()),
            Some(Ok(Message::Text(text))) => early.push(text),
            Some(Ok(Message::Ping(data))) => ws_tx.send(Message::Pong(data)).await?,
            Some(Ok(Message::Close(_))) | None => return Err(PeerError::ConnectionClosed),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(_)) => {}
        }
    }
}

async fn drive(inner: &Arc<Inner>, generation: u64, url: &str) -> Result<(), PeerError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    let ping_timeout = inner.config.ping_timeout;

    // Frames that arrive before the probe answer are replayed after Connected.
    let mut early = Vec::new();
    tokio::time::timeout(ping_timeout, probe(&mut ws_tx, &mut ws_rx, &mut early))
        .await
        .map_err(|_| PeerError::ProbeTimeout)??;

    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    {
        let mut tasks = lock(&inner.tasks);
        if !lock(&inner.link).on_probe_succeeded(generation) {
            debug!(generation, "probe answered for a superseded attempt");
            return Ok(());
        }
        tasks.outbound = Some(out_tx);
    }
    inner.status.send_replace(LinkStatus::Connected);
    info!(%url, "connected to relay");
    emit(inner, generation, TransportEvent::Connected).await;
    for text in early {
        emit(inner, generation, TransportEvent::Message(text)).await;
    }

    let period = inner.config.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    emit(inner, generation, TransportEvent::Message(text)).await;
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => emit(inner, generation, TransportEvent::Message(text)).await,
                    Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(data))) => ws_tx.send(Message::Pong(data)).await?,
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Close(_))) | None => return Err(PeerError::ConnectionClosed),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Frame(_))) => {}
            },
            out = out_rx.recv() => match out {
                Some(text) => ws_tx.send(Message::Text(text)).await?,
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            _ = keepalive.tick() => {
                if !lock(&inner.link).is_current(generation) {
                    return Ok(());
                }
                ws_tx.send(Message::Ping(Vec::new())).await?;
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + ping_timeout);
                }
            }
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                return Err(PeerError::KeepaliveTimeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn state() -> LinkState {
        LinkState::new(ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            2.0,
        ))
    }

    #[test]
    fn stale_probe_cannot_mark_connected() {
        let mut link = state();
        let first = link.begin_attempt("ws://relay".into());
        let second = link.begin_attempt("ws://relay".into());

        assert!(!link.on_probe_succeeded(first));
        assert_eq!(link.status, LinkStatus::Connecting);
        assert_eq!(link.on_failure(first), None);
        assert_eq!(link.status, LinkStatus::Connecting);

        assert!(link.on_probe_succeeded(second));
        assert_eq!(link.status, LinkStatus::Connected);
    }

    #[test]
    fn consecutive_failures_back_off_then_success_resets() {
        let mut link = state();
        let mut delays = Vec::new();
        for _ in 0..7 {
            let generation = link.begin_attempt("ws://relay".into());
            delays.push(link.on_failure(generation).unwrap().as_secs());
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);

        let generation = link.begin_attempt("ws://relay".into());
        assert!(link.on_probe_succeeded(generation));
        assert_eq!(link.backoff.attempts(), 0);
        assert_eq!(link.on_failure(generation), Some(Duration::from_secs(1)));
    }

    #[test]
    fn invalidate_orphans_attempt_and_stops_retry() {
        let mut link = state();
        let generation = link.begin_attempt("ws://relay".into());
        link.invalidate();
        assert_eq!(link.on_failure(generation), None);
        assert!(!link.on_probe_succeeded(generation));
        assert_eq!(link.status, LinkStatus::Disconnected);
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            keepalive_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(2),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
        }
    }

    /// Echo server that accepts `sessions` sockets; each closes after `per_session` texts.
    async fn echo_server(sessions: usize, per_session: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..sessions {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let mut seen = 0;
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        ws.send(Message::Text(text)).await.unwrap();
                        seen += 1;
                        if seen == per_session {
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                }
            }
        });
        format!("ws://{addr}")
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport dropped")
    }

    #[tokio::test]
    async fn connects_and_exchanges_text() {
        let url = echo_server(1, usize::MAX).await;
        let (transport, mut events) = Transport::new(fast_config());
        assert!(!transport.send("too early".into()));

        transport.connect(&url);
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        assert_eq!(transport.status(), LinkStatus::Connected);

        assert!(transport.send("hello".into()));
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message("hello".into())
        );
        transport.disconnect().await;
        assert_eq!(transport.status(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn reconnects_after_relay_closes() {
        let url = echo_server(2, 1).await;
        let (transport, mut events) = Transport::new(fast_config());
        transport.connect(&url);
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

        transport.send("bye".into());
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message("bye".into())
        );
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { .. }
        ));
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn keeps_retrying_unreachable_relay_until_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (transport, mut events) = Transport::new(fast_config());
        transport.connect(&url);
        for _ in 0..3 {
            assert!(matches!(
                next_event(&mut events).await,
                TransportEvent::Disconnected { .. }
            ));
        }

        transport.disconnect().await;
        let quiet = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
        assert!(quiet.is_err(), "no events expected after disconnect");
        assert_eq!(transport.status(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn close_stops_a_live_link_without_redialing() {
        let url = echo_server(2, usize::MAX).await;
        let (transport, mut events) = Transport::new(fast_config());
        transport.connect(&url);
        assert_eq!(next_event(&mut events).await, TransportEvent::Connected);

        transport.close();
        assert_eq!(transport.status(), LinkStatus::Disconnected);
        assert!(!transport.send("after close".into()));
        let quiet = tokio::time::timeout(Duration::from_millis(500), events.recv()).await;
        assert!(quiet.is_err(), "closed link must not reconnect");
        assert_eq!(transport.status(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn explicit_connect_after_failure_reports_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (transport, mut events) = Transport::new(fast_config());
        transport.connect(&url);
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected { .. }
        ));
        transport.connect(&url);
        assert_eq!(transport.status(), LinkStatus::Connecting);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn foreground_is_noop_when_never_connected() {
        let (transport, mut events) = Transport::new(fast_config());
        transport.foreground();
        assert_eq!(transport.status(), LinkStatus::Disconnected);
        assert!(events.try_recv().is_err());
    }
}
