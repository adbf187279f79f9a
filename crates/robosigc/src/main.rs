#![forbid(unsafe_code)]

use clap::Parser;
use robosigc::config::Cli;
use robosigc::{connect, PeerError};
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

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

    // stdout carries protocol events, so logs go to stderr or a file
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

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    if let Err(e) = cli.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    info!(server = %cli.server, role = %cli.role, "connecting");
    let result = match connect(&cli.server, cli.role).await {
        Ok(link) => {
            let input = BufReader::new(tokio::io::stdin());
            link.run(input, tokio::io::stdout()).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => Ok(()),
        Err(PeerError::Server(text)) => {
            error!("signaling server error: {}", text);
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}
