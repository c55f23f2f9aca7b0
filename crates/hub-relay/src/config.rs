use clap::Parser;
use hub_common::types::DEFAULT_CHALLENGE_TTL_SECS;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "hub-relay")]
#[command(about = "Rendezvous relay for desktop hosts and mobile clients")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "HUB_RELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Port to listen on, on all interfaces. Overrides the port in `--listen`.
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,
    /// Relay URL advertised to clients inside pairing codes.
    #[arg(long, default_value = "ws://localhost:8080", env = "RELAY_PUBLIC_URL")]
    pub public_url: String,
    /// Socket address for the metrics and health endpoints.
    #[arg(long, default_value = "127.0.0.1:9090", env = "HUB_RELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Lifetime of authentication challenges in seconds.
    #[arg(long, default_value = "60", env = "HUB_RELAY_CHALLENGE_TTL")]
    pub challenge_ttl: u64,
    /// Upper bound on the pairing code lifetime a host may request, in seconds.
    #[arg(long, default_value = "600", env = "HUB_RELAY_MAX_PAIRING_TTL")]
    pub max_pairing_ttl: u64,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "HUB_RELAY_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "HUB_RELAY_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "1048576", env = "HUB_RELAY_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Interval between sweeps of expired challenges, in seconds.
    #[arg(long, default_value = "60", env = "HUB_RELAY_SWEEP_INTERVAL")]
    pub sweep_interval: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Relay URL advertised in pairing codes.
    pub public_url: String,
    /// Socket address for the metrics and health endpoints.
    pub metrics_addr: SocketAddr,
    /// Lifetime of authentication challenges in seconds.
    pub challenge_ttl: u64,
    /// Upper bound on requested pairing code lifetimes in seconds.
    pub max_pairing_ttl: u64,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// Maximum WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between sweeps of expired challenges, in seconds.
    pub sweep_interval: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.public_url.starts_with("ws://") || self.public_url.starts_with("wss://")) {
            return Err(format!(
                "public_url must start with ws:// or wss://, got: {}",
                self.public_url
            ));
        }

        if self.challenge_ttl == 0 {
            return Err("challenge_ttl must be greater than 0".to_string());
        }
        if self.challenge_ttl > 3600 {
            return Err("challenge_ttl exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.max_pairing_ttl == 0 {
            return Err("max_pairing_ttl must be greater than 0".to_string());
        }
        if self.max_pairing_ttl > 86_400 {
            return Err(
                "max_pairing_ttl exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }

        const MIN_MESSAGE_SIZE: usize = 1024;
        const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(format!(
                "max_message_size must be at least {MIN_MESSAGE_SIZE} bytes"
            ));
        }
        if self.max_message_size > MAX_MESSAGE_SIZE {
            return Err(format!(
                "max_message_size exceeds maximum allowed ({MAX_MESSAGE_SIZE} bytes)"
            ));
        }

        if self.sweep_interval == 0 {
            return Err("sweep_interval must be greater than 0".to_string());
        }
        if self.sweep_interval > 3600 {
            return Err("sweep_interval exceeds reasonable limit (3600 seconds)".to_string());
        }
        Ok(())
    }

    /// Lifetime of host and client authentication challenges.
    #[must_use]
    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl)
    }

    /// Lifetime granted for a pairing code when the host asked for `requested` seconds.
    ///
    /// Zero means "use the default"; anything above the configured maximum is clamped.
    #[must_use]
    pub fn pairing_ttl(&self, requested: u64) -> Duration {
        let secs = if requested == 0 {
            DEFAULT_CHALLENGE_TTL_SECS
        } else {
            requested
        };
        Duration::from_secs(secs.min(self.max_pairing_ttl))
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let listen = match args.port {
            Some(port) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            None => args.listen,
        };
        Self {
            listen,
            public_url: args.public_url,
            metrics_addr: args.metrics_addr,
            challenge_ttl: args.challenge_ttl,
            max_pairing_ttl: args.max_pairing_ttl,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            max_message_size: args.max_message_size,
            sweep_interval: args.sweep_interval,
        }
    }
}
