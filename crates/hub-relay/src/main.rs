#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use hub_relay::config::{Args, ServerConfig};
use hub_relay::metrics::{start_metrics_server, HealthState};
use hub_relay::{run_with_shutdown, ServerState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config: ServerConfig = Args::parse().into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!(listen = %config.listen, public_url = %config.public_url, "bound relay listener");

    let health_state = HealthState::new(Arc::clone(&state));
    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!(error = %e, "metrics server error");
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let mut server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::select! {
        result = &mut server => {
            report(result);
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    health_state.set_ready(false);
    let _ = shutdown_tx.send(());
    report(server.await);
    Ok(())
}

fn report(result: Result<Result<(), hub_relay::error::RelayError>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "server error"),
        Err(e) => error!(error = %e, "server task failed"),
    }
}
