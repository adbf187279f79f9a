#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use robosigs::config::{Args, ServerConfig};
use robosigs::metrics::{start_metrics_server, OpsState};
use robosigs::run_with_shutdown;
use robosigs::server::ServerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

// One thread: connection tasks interleave cooperatively, as the
// registry's non-suspending transitions assume.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let ops = OpsState::new(Arc::clone(&state));

    if let Some(metrics_addr) = config.metrics_addr {
        let ops = ops.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_addr, ops).await {
                warn!("metrics server error: {}", e);
            }
        });
    }

    let signal = async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        ops.begin_drain();
    };

    if let Err(e) = run_with_shutdown(listener, state, signal).await {
        tracing::error!("server error: {}", e);
    }

    Ok(())
}
