//! Prometheus recorder and the ops HTTP endpoints served next to it.

use crate::server::ServerState;
use axum::extract::State;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Role occupancy as reported on `/health`.
#[derive(Debug, Serialize)]
struct SessionReport {
    status: &'static str,
    robot: bool,
    client: bool,
    waiting_for_robot: bool,
}

/// State shared by the ops endpoints.
#[derive(Clone)]
pub struct OpsState {
    draining: Arc<AtomicBool>,
    server: Arc<ServerState>,
}

impl OpsState {
    /// Report on `server` until [`OpsState::begin_drain`] is called.
    #[must_use]
    pub fn new(server: Arc<ServerState>) -> Self {
        Self {
            draining: Arc::new(AtomicBool::new(false)),
            server,
        }
    }

    /// Flip `/ready` to 503 for the rest of the process lifetime.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Whether shutdown has started.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }
}

/// Install the Prometheus recorder and serve `/metrics`, `/health` and
/// `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP server fails.
pub async fn start_metrics_server(addr: SocketAddr, ops: OpsState) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(session_handler))
        .route("/ready", get(ready_handler))
        .with_state(ops);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn session_handler(State(ops): State<OpsState>) -> Json<SessionReport> {
    let snap = ops.server.registry.snapshot();
    Json(SessionReport {
        status: "ok",
        robot: snap.robot.is_some(),
        client: snap.client.is_some(),
        waiting_for_robot: snap.waiting_for_robot,
    })
}

async fn ready_handler(State(ops): State<OpsState>) -> (StatusCode, &'static str) {
    if ops.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining\n")
    } else {
        (StatusCode::OK, "ready\n")
    }
}

/// Connection and role gauges.
pub mod gauges {
    use robosig_common::Role;

    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("robosig_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("robosig_connections_active").decrement(1.0);
    }

    /// Record whether a role slot is occupied.
    pub fn set_role_registered(role: Role, registered: bool) {
        let value = if registered { 1.0 } else { 0.0 };
        metrics::gauge!("robosig_role_registered", "role" => role.as_str()).set(value);
    }
}

/// Event counters.
pub mod counters {
    use robosig_common::Role;

    /// Record a role declaration with its outcome (`accepted`, `duplicate`, `displaced`).
    pub fn registrations_total(role: Role, outcome: &'static str) {
        metrics::counter!(
            "robosig_registrations_total",
            "role" => role.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Increment the relayed-messages counter for messages sent by `from`.
    pub fn messages_relayed_total(from: Role) {
        metrics::counter!("robosig_messages_relayed_total", "from" => from.as_str()).increment(1);
    }

    /// Increment the failed-relay counter with the given reason label.
    pub fn relay_failures_total(reason: &'static str) {
        metrics::counter!("robosig_relay_failures_total", "reason" => reason).increment(1);
    }

    /// Count a connection refused before it became a signaling peer.
    pub fn connections_rejected_total(reason: &'static str) {
        metrics::counter!("robosig_connections_rejected_total", "reason" => reason).increment(1);
    }

    /// Count a liveness probe answered on the signaling port.
    pub fn health_probes_total() {
        metrics::counter!("robosig_health_probes_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a relay latency observation in seconds.
    pub fn relay_latency_seconds(value: f64) {
        metrics::histogram!("robosig_relay_latency_seconds").record(value);
    }
}
