use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI interface for the peer binary.
#[derive(Parser)]
#[command(name = "hub-peer", about = "Host and client endpoints for the hub relay")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Relay server URL override.
    #[arg(long, global = true)]
    pub relay: Option<String>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run as a host and serve sessions to paired clients.
    Host {
        /// Display name announced to the relay.
        #[arg(long)]
        name: Option<String>,
        /// Request a pairing QR payload once connected.
        #[arg(long)]
        pair: bool,
    },
    /// Pair this client with a host using the JSON from its QR code.
    Pair {
        /// QR payload JSON.
        qr: String,
    },
    /// Reconnect to the previously paired host.
    Connect,
    /// Print the local peer ids and public key.
    Identity,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// WebSocket base URL of the relay server.
    pub relay: String,
    /// Reconnection backoff settings.
    pub reconnect: ReconnectConfig,
    /// Liveness probe and keepalive settings.
    pub keepalive: KeepaliveConfig,
    /// Pairing timeouts.
    pub pairing: PairingConfig,
    /// Host-role settings.
    pub host: HostConfig,
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnect attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between reconnect attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
}

/// WebSocket keepalive settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Interval between keepalive pings, in seconds.
    pub interval_s: u64,
    /// How long a ping may go unanswered, in seconds.
    pub ping_timeout_s: u64,
}

/// Pairing flow timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// Give up on a pairing attempt after this many seconds.
    pub timeout_s: u64,
    /// Lifetime requested for the QR challenge, in seconds.
    pub ttl_s: u64,
}

/// Host-role settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Name shown on paired clients; the machine hostname when empty.
    #[serde(default)]
    pub display_name: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay: "ws://localhost:8080".to_string(),
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            pairing: PairingConfig::default(),
            host: HostConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_s: 25,
            ping_timeout_s: 10,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_s: 15,
            ttl_s: 120,
        }
    }
}

impl PeerConfig {
    /// Reject values the transport and pairing flow cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.relay.starts_with("ws://") || self.relay.starts_with("wss://")) {
            return Err(format!("relay must be a ws:// or wss:// URL, got {:?}", self.relay));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 || reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(format!(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms, got {} and {}",
                reconnect.initial_delay_ms, reconnect.max_delay_ms
            ));
        }
        if !self.reconnect.backoff_factor.is_finite() || self.reconnect.backoff_factor < 1.0 {
            return Err("reconnect.backoff_factor must be a finite number >= 1".to_string());
        }

        for (name, value) in [
            ("keepalive.interval_s", self.keepalive.interval_s),
            ("keepalive.ping_timeout_s", self.keepalive.ping_timeout_s),
            ("pairing.timeout_s", self.pairing.timeout_s),
            ("pairing.ttl_s", self.pairing.ttl_s),
        ] {
            if value == 0 {
                return Err(format!("{name} must be at least 1"));
            }
        }

        Ok(())
    }
}

/// Layer defaults, the TOML file (explicit path or the platform default)
/// and `HUB_PEER_*` environment variables, in that order.
///
/// Nested keys use a double underscore: `HUB_PEER_RECONNECT__MAX_DELAY_MS`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a value has the wrong type.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<PeerConfig> {
    let file = match path {
        Some(explicit) => Some(explicit.to_path_buf()),
        None => default_config_path(),
    }
    .filter(|p| p.exists());

    let mut builder =
        config::Config::builder().add_source(config::Config::try_from(&PeerConfig::default())?);
    if let Some(file) = file {
        builder = builder.add_source(config::File::from(file));
    }
    let settings = builder
        .add_source(
            config::Environment::with_prefix("HUB_PEER")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// `<platform config dir>/hub-peer/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hub-peer").join("config.toml"))
}
