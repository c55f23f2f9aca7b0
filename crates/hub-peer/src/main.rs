#![forbid(unsafe_code)]

use hub_peer::client::{run_client, ClientAgent, ClientCommand, ClientUpdate};
use hub_peer::config::{load_config, Cli, Commands, PeerConfig};
use hub_peer::credentials::{CredentialStore, FileCredentialStore};
use hub_peer::host::{run_host, HostAgent, HostCommand, HostOptions, HostUpdate, PairingStatus};
use hub_peer::identity;
use hub_peer::services::{SessionProvider, TerminalSink};
use hub_peer::transport::{Transport, TransportConfig};

use clap::Parser;
use ed25519_dalek::SigningKey;
use hub_common::crypto::public_key_base64;
use hub_common::messages::SessionSummary;
use hub_common::pairing::PairingQrPayload;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── ANSI style helpers ──────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";

fn tty() -> bool {
    std::io::stdout().is_terminal()
}

// ── Shared helpers ──────────────────────────────────────────────────

/// `<platform data dir>/hub-peer/<filename>`, or the bare name if there is none.
fn resolve_data_path(filename: &str) -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("hub-peer").join(filename))
        .unwrap_or_else(|| PathBuf::from(filename))
}

fn machine_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "hub-peer".to_string())
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = cli.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    Ok(())
}

fn load_validated_config(cli: &Cli) -> anyhow::Result<PeerConfig> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(ref relay) = cli.relay {
        config.relay = relay.clone();
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;
    Ok(config)
}

fn load_key() -> anyhow::Result<SigningKey> {
    identity::load_or_generate_keypair(&resolve_data_path("key"))
}

// ── Host ────────────────────────────────────────────────────────────

/// Session backend for a bare CLI host: no sessions, terminal writes logged.
struct DetachedSessions;

impl SessionProvider for DetachedSessions {
    fn list_sessions(&self) -> Vec<SessionSummary> {
        Vec::new()
    }
}

impl TerminalSink for DetachedSessions {
    fn send_input(&self, session_id: Uuid, text: &str) {
        debug!(%session_id, bytes = text.len(), "terminal input for detached host");
    }

    fn resize(&self, session_id: Uuid, cols: u16, rows: u16) {
        debug!(%session_id, cols, rows, "resize for detached host");
    }
}

async fn run_host_command(cli: &Cli, name: Option<String>, pair: bool) -> anyhow::Result<()> {
    let config = load_validated_config(cli)?;
    let key = Arc::new(load_key()?);
    let host_id = identity::load_or_create_id(&resolve_data_path("host.id"))?;
    let display_name = name
        .or_else(|| Some(config.host.display_name.clone()).filter(|n| !n.is_empty()))
        .unwrap_or_else(machine_name);

    if std::io::stderr().is_terminal() {
        let v = env!("CARGO_PKG_VERSION");
        eprintln!();
        eprintln!("  {BOLD}◈ Hub Host{RESET} {DIM}v{v}{RESET}");
        eprintln!("  {DIM}Name{RESET}       {display_name}");
        eprintln!("  {DIM}Host id{RESET}    {CYAN}{host_id}{RESET}");
        eprintln!("  {DIM}Relay{RESET}      {}", config.relay);
        eprintln!();
    }
    info!(%host_id, relay = %config.relay, "starting host");

    let mut options = HostOptions::new(host_id, display_name);
    options.relay_url = Some(config.relay.clone());
    options.pairing_timeout = Duration::from_secs(config.pairing.timeout_s);
    options.pairing_ttl = config.pairing.ttl_s;

    let (transport, events) = Transport::new(TransportConfig::from(&config));
    let backend = Arc::new(DetachedSessions);
    let agent = HostAgent::new(transport, options, key, backend.clone(), backend);
    let mut updates = agent.subscribe();

    let (commands_tx, commands_rx) = mpsc::channel(64);
    if pair {
        commands_tx.send(HostCommand::RequestPairing).await?;
    }
    let mut driver = tokio::spawn(run_host(agent, events, commands_rx));

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => print_host_update(&update),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(n, "missed host updates"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                let _ = commands_tx.send(HostCommand::Shutdown).await;
                break;
            }
            _ = &mut driver => return Ok(()),
        }
    }
    driver.await?;
    Ok(())
}

fn print_host_update(update: &HostUpdate) {
    match update {
        HostUpdate::State(state) => info!(?state, "host state"),
        HostUpdate::Pairing(PairingStatus::Ready { qr_json, payload }) => {
            if tty() {
                println!();
                println!("  {BOLD}Pairing code{RESET} {DIM}(expires {}){RESET}", payload.expires_at);
                println!("  {CYAN}{qr_json}{RESET}");
                println!();
            } else {
                println!("{qr_json}");
            }
        }
        HostUpdate::Pairing(PairingStatus::Failed(reason)) => {
            eprintln!("  {RED}✗{RESET} {reason}");
        }
        HostUpdate::Pairing(_) => {}
        HostUpdate::ClientPaired {
            client_id,
            device_name,
        } => {
            if tty() {
                println!("  {GREEN}✓{RESET} Paired {BOLD}{device_name}{RESET} {DIM}({client_id}){RESET}");
            } else {
                println!("paired: {device_name} {client_id}");
            }
        }
    }
}

// ── Client ──────────────────────────────────────────────────────────

async fn run_client_command(cli: &Cli, pairing_code: Option<PairingQrPayload>) -> anyhow::Result<()> {
    let config = load_validated_config(cli)?;
    let key = Arc::new(load_key()?);
    let client_id = identity::load_or_create_id(&resolve_data_path("client.id"))?;
    let store: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::load(resolve_data_path("paired.toml"))?);

    if pairing_code.is_none() && store.paired_host().is_none() {
        anyhow::bail!("this device is not paired yet; run `hub-peer pair '<qr json>'` first");
    }

    let (transport, events) = Transport::new(TransportConfig::from(&config));
    let agent = ClientAgent::new(transport, client_id, machine_name(), key, store)
        .with_pairing_timeout(Duration::from_secs(config.pairing.timeout_s));
    let mut updates = agent.subscribe();

    let (commands_tx, commands_rx) = mpsc::channel(64);
    let first = match pairing_code {
        Some(qr) => ClientCommand::Pair(qr),
        None => ClientCommand::Reconnect,
    };
    commands_tx.send(first).await?;
    let mut driver = tokio::spawn(run_client(agent, events, commands_rx));

    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut attached: Option<Uuid> = None;

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => print_client_update(&update),
                Err(broadcast::error::RecvError::Lagged(n)) => debug!(n, "missed client updates"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if let Some(command) = parse_input(&line, &mut attached) {
                    commands_tx.send(command).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            _ = &mut driver => return Ok(()),
        }
    }
    let _ = commands_tx.send(ClientCommand::Shutdown).await;
    driver.await?;
    Ok(())
}

/// `:open <id>` attaches, `:ls` lists, `:int` interrupts; other lines are typed.
fn parse_input(line: &str, attached: &mut Option<Uuid>) -> Option<ClientCommand> {
    let trimmed = line.trim();
    if trimmed == ":ls" {
        return Some(ClientCommand::ListSessions);
    }
    if let Some(id) = trimmed.strip_prefix(":open ") {
        let session_id = Uuid::parse_str(id.trim()).ok()?;
        *attached = Some(session_id);
        return Some(ClientCommand::OpenSession {
            session_id,
            cols: None,
            rows: None,
        });
    }
    let session_id = (*attached)?;
    if trimmed == ":int" {
        return Some(ClientCommand::Interrupt(session_id));
    }
    Some(ClientCommand::Input {
        session_id,
        text: format!("{line}\n"),
    })
}

fn print_client_update(update: &ClientUpdate) {
    match update {
        ClientUpdate::State(state) => info!(?state, "client state"),
        ClientUpdate::Status(status) => eprintln!("  {DIM}{status}{RESET}"),
        ClientUpdate::Paired(record) => {
            eprintln!("  {GREEN}✓{RESET} Paired with {BOLD}{}{RESET}", record.host_name);
        }
        ClientUpdate::PairingFailed(reason) => eprintln!("  {RED}✗{RESET} {reason}"),
        ClientUpdate::SessionList(sessions) => {
            for session in sessions {
                println!("  {CYAN}{}{RESET}  {}  {DIM}{}{RESET}", session.id, session.name, session.status);
            }
            if sessions.is_empty() {
                println!("  {DIM}no sessions{RESET}");
            }
        }
        ClientUpdate::Snapshot { data, .. } | ClientUpdate::Output { data, .. } => print!("{data}"),
        ClientUpdate::SessionUpdated(session) | ClientUpdate::SessionCreated(session) => {
            println!("  {CYAN}{}{RESET}  {}  {DIM}{}{RESET}", session.id, session.name, session.status);
        }
        ClientUpdate::ProjectPaths(paths) => {
            for entry in &paths.recent_paths {
                println!("  {}  {DIM}{}{RESET}", entry.name, entry.path);
            }
        }
    }
}

// ── Entry point ─────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    match cli.command {
        Commands::Host { ref name, pair } => run_host_command(&cli, name.clone(), pair).await,
        Commands::Pair { ref qr } => {
            let code = PairingQrPayload::parse(qr)
                .map_err(|e| anyhow::anyhow!("not a pairing code: {e}"))?;
            run_client_command(&cli, Some(code)).await
        }
        Commands::Connect => run_client_command(&cli, None).await,
        Commands::Identity => {
            let key = load_key()?;
            let host_id = identity::load_or_create_id(&resolve_data_path("host.id"))?;
            let client_id = identity::load_or_create_id(&resolve_data_path("client.id"))?;
            if tty() {
                println!();
                println!("  {DIM}Public key{RESET} {CYAN}{}{RESET}", public_key_base64(&key));
                println!("  {DIM}Host id{RESET}    {host_id}");
                println!("  {DIM}Client id{RESET}  {client_id}");
                println!();
            } else {
                println!("public_key: {}", public_key_base64(&key));
                println!("host_id: {host_id}");
                println!("client_id: {client_id}");
            }
            Ok(())
        }
    }
}
