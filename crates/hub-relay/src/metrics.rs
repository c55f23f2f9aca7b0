use crate::server::ServerState;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    hosts: usize,
    clients: usize,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Readiness flag plus a view of the relay for health reporting.
#[derive(Clone)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
    server: Arc<ServerState>,
}

impl HealthState {
    /// Create a health state for `server`, initially ready.
    #[must_use]
    pub fn new(server: Arc<ServerState>) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
            server,
        }
    }

    /// Flip readiness, e.g. to drain traffic before shutdown.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Whether the relay accepts new traffic.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Serve `/`, `/health`, `/ready` and `/metrics` on `addr`.
///
/// # Errors
///
/// Returns an error if the Prometheus recorder cannot be installed or the
/// listener cannot bind.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route("/", get(liveness_handler))
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", {
            let state = health_state.clone();
            get(move || health_handler(state.clone()))
        })
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Body of the plain `GET /` liveness answer.
pub const LIVENESS_BODY: &str = "hub-relay OK";

async fn liveness_handler() -> &'static str {
    LIVENESS_BODY
}

async fn health_handler(state: HealthState) -> (StatusCode, Json<HealthResponse>) {
    let (hosts, clients) = state.server.registry.socket_counts();
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            hosts,
            clients,
        }),
    )
}

async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "draining",
                ready: false,
            }),
        )
    }
}

/// Connection count gauges.
pub mod gauges {
    /// Increment the active connections gauge for a peer role.
    pub fn inc_connections_active(role: &'static str) {
        metrics::gauge!("hub_connections_active", "role" => role).increment(1.0);
    }

    /// Decrement the active connections gauge for a peer role.
    pub fn dec_connections_active(role: &'static str) {
        metrics::gauge!("hub_connections_active", "role" => role).decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record an authentication attempt for a role with the given result label.
    pub fn auth_total(role: &'static str, result: &'static str) {
        metrics::counter!("hub_auth_total", "role" => role, "result" => result).increment(1);
    }

    /// Record a pairing step (`created`, `requested`, `approved`, `rejected`).
    pub fn pairing_total(stage: &'static str) {
        metrics::counter!("hub_pairing_total", "stage" => stage).increment(1);
    }

    /// Increment the forwarded-messages counter.
    pub fn messages_forwarded_total() {
        metrics::counter!("hub_messages_forwarded_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("hub_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Record challenges removed by the expiry sweep.
    pub fn challenges_purged_total(count: u64) {
        metrics::counter!("hub_challenges_purged_total").increment(count);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long one inbound message took to dispatch, in seconds.
    pub fn dispatch_latency_seconds(value: f64) {
        metrics::histogram!("hub_dispatch_latency_seconds").record(value);
    }
}
