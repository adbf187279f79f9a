use crate::config::ServerConfig;
use crate::connection::{handle_connection, log_outcome};
use crate::error::SignalError;
use crate::metrics::counters;
use crate::session::Registry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Shared state for the signaling server.
pub struct ServerState {
    /// Robot/client role registry.
    pub registry: Registry,
    /// Runtime server configuration.
    pub config: ServerConfig,
}

impl ServerState {
    /// Create server state with an empty registry.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
        }
    }
}

/// Run the accept loop until the process ends.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), SignalError> {
    run_with_shutdown(listener, state, std::future::pending()).await
}

/// Run the server accept loop until `signal` resolves.
///
/// On shutdown the listener is dropped, every connection task is told to
/// stop through a shared cancellation channel, and the call waits for all
/// of them to finish (up to the configured drain timeout, after which the
/// stragglers are aborted).
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown<F>(
    listener: TcpListener,
    state: Arc<ServerState>,
    signal: F,
) -> Result<(), SignalError>
where
    F: Future<Output = ()>,
{
    let local_addr = listener.local_addr().map_err(SignalError::Io)?;
    info!("server listening on {}", local_addr);

    let (cancel_tx, cancel_rx) = watch::channel(());
    let mut tasks: JoinSet<()> = JoinSet::new();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if tasks.len() >= state.config.max_conns {
                            warn!("max connections reached, rejecting {}", addr);
                            counters::connections_rejected_total("max_conns");
                            drop(stream);
                            continue;
                        }
                        let conn_id = state.registry.next_conn_id();
                        debug!(conn_id, %addr, "accepted connection");
                        let state = Arc::clone(&state);
                        let cancel = cancel_rx.clone();
                        tasks.spawn(async move {
                            let result = handle_connection(stream, conn_id, state, cancel).await;
                            log_outcome(conn_id, addr, &result);
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join(joined);
            }
            () = &mut signal => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                break;
            }
        }
    }

    drop(listener);
    cancel_tx.send_replace(());
    drain(tasks, state.config.drain_timeout()).await;

    info!("server shut down gracefully");
    Ok(())
}

/// Wait for every connection task; abort whatever is left at the deadline.
async fn drain(mut tasks: JoinSet<()>, drain_timeout: Duration) {
    let deadline = tokio::time::Instant::now() + drain_timeout;
    while !tasks.is_empty() {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(joined)) => log_join(joined),
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "drain timeout reached with {} connections still active",
                    tasks.len()
                );
                tasks.abort_all();
                while let Some(joined) = tasks.join_next().await {
                    log_join(joined);
                }
            }
        }
    }
}

/// Cancellation is the expected way for a task to end during shutdown and
/// is not reported; a panic is.
fn log_join(joined: Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("connection task cancelled"),
        Err(e) => error!("connection task panicked: {}", e),
    }
}
