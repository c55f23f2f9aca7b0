use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::metrics::counters;
use crate::registry::Registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the relay server.
#[derive(Debug)]
pub struct ServerState {
    /// Sockets, identities, challenges and the trust ledger.
    pub registry: Registry,
    /// Runtime server configuration.
    pub config: ServerConfig,
    next_conn_id: AtomicU64,
}

impl ServerState {
    /// Fresh state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a newly accepted socket.
    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the accept loop until `shutdown` fires or its sender is dropped.
///
/// Live sockets are sent a Close frame on the same signal and get up to 30
/// seconds to finish before they are aborted.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "relay listening");

    let sweeper = tokio::spawn(sweep_expired(Arc::clone(&state)));
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        let closing = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state, closing).await {
                                debug!(%addr, error = %e, "connection closed");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => {
                info!(active = connections.len(), "shutdown signal received, draining connections");
                break;
            }
        }
    }

    sweeper.abort();
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "drain timeout reached, aborting connections"
        );
        connections.abort_all();
    }

    info!("relay shut down gracefully");
    Ok(())
}

/// Periodically drop expired challenges so abandoned handshakes do not pile up.
async fn sweep_expired(state: Arc<ServerState>) {
    let period = Duration::from_secs(state.config.sweep_interval);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let purged = state.registry.purge_expired();
        let total = purged.auth_challenges + purged.pairing_challenges;
        if total > 0 {
            debug!(
                auth = purged.auth_challenges,
                pairing = purged.pairing_challenges,
                "purged expired challenges"
            );
            counters::challenges_purged_total(total as u64);
        }
    }
}
