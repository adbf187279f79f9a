use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the signaling server.
#[derive(Parser, Debug, Clone)]
#[command(name = "robosigs")]
#[command(about = "Robot/client WebRTC signaling and relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:5000", env = "ROBOSIG_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "ROBOSIG_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Do not start the metrics endpoint.
    #[arg(long)]
    pub no_metrics: bool,
    /// Maximum concurrent connections (signaling peers only need two).
    #[arg(long, default_value = "64", env = "ROBOSIG_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    #[arg(long, default_value = "1048576", env = "ROBOSIG_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Seconds allowed for the HTTP request line and WebSocket upgrade.
    #[arg(long, default_value = "10", env = "ROBOSIG_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Seconds to wait for connections to wind down on shutdown.
    #[arg(long, default_value = "5", env = "ROBOSIG_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint, `None` when disabled.
    pub metrics_addr: Option<SocketAddr>,
    /// Maximum concurrent connections.
    pub max_conns: usize,
    /// Maximum WebSocket message size in bytes.
    pub max_payload: usize,
    /// Seconds allowed for the pre-upgrade phase.
    pub handshake_timeout: u64,
    /// Seconds to wait for connections to wind down on shutdown.
    pub drain_timeout: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns < 2 {
            return Err("max_conns must allow at least a robot and a client (2)".to_string());
        }
        if self.max_conns > 100_000 {
            return Err("max_conns exceeds reasonable limit (100,000)".to_string());
        }

        // SDP documents are a few KiB; anything above 16 MiB is a mistake
        const MAX_ALLOWED_PAYLOAD: usize = 16 * 1024 * 1024;
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_PAYLOAD
            ));
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.drain_timeout > 600 {
            return Err("drain_timeout exceeds reasonable limit (600 seconds)".to_string());
        }

        if let Some(metrics_addr) = self.metrics_addr {
            if metrics_addr == self.listen {
                return Err("metrics_addr must differ from listen".to_string());
            }
        }
        Ok(())
    }

    /// Pre-upgrade deadline as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Shutdown drain deadline as a [`Duration`].
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: (!args.no_metrics).then_some(args.metrics_addr),
            max_conns: args.max_conns,
            max_payload: args.max_payload,
            handshake_timeout: args.handshake_timeout,
            drain_timeout: args.drain_timeout,
        }
    }
}
