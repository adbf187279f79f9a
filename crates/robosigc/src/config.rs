use clap::Parser;
use robosig_common::Role;
use std::path::PathBuf;

/// CLI interface for the signaling peer.
///
/// Signaling payloads are exchanged with a local process as one JSON
/// document per line: stdin lines go to the server, server events come out
/// on stdout.
#[derive(Parser, Debug)]
#[command(name = "robosigc", about = "Robosig signaling peer")]
#[command(version)]
pub struct Cli {
    /// WebSocket URL of the signaling server.
    #[arg(long, env = "ROBOSIG_SERVER", default_value = "ws://127.0.0.1:5000/")]
    pub server: String,

    /// Role to declare: `robot` or `client`.
    #[arg(long, env = "ROBOSIG_ROLE")]
    pub role: Role,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Check the server URL before dialing it.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the URL is not `ws://` or
    /// `wss://`.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.server.starts_with("ws://") || self.server.starts_with("wss://")) {
            return Err(format!(
                "server URL must start with ws:// or wss://, got {:?}",
                self.server
            ));
        }
        Ok(())
    }
}
