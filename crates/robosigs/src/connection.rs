use crate::error::SignalError;
use crate::health::{self, Preamble};
use crate::metrics::{counters, gauges, histograms};
use crate::server::ServerState;
use crate::session::{ConnId, PeerHandle, Registration, SlotGuard};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use robosig_common::{Inbound, Outbound, Role};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsRecv = SplitStream<WebSocketStream<TcpStream>>;

/// Frames queued for a peer that has not written them out yet.
const PEER_QUEUE: usize = 256;

const DUPLICATE_ROBOT_TEXT: &str = "multiple robots are not supported";

/// Keeps the active-connections gauge honest even if the task is aborted.
struct ActiveConnection;

impl ActiveConnection {
    fn enter() -> Self {
        gauges::inc_connections_active();
        Self
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        gauges::dec_connections_active();
    }
}

async fn send_outbound(ws_tx: &mut WsSink, out: Outbound) -> Result<(), SignalError> {
    ws_tx.send(Message::Text(out.encode())).await?;
    Ok(())
}

/// Either answer a health probe (returning `None`) or complete the
/// WebSocket upgrade.
async fn accept(
    mut stream: TcpStream,
    state: &ServerState,
) -> Result<Option<WebSocketStream<TcpStream>>, SignalError> {
    match health::sniff(&stream).await? {
        Preamble::HealthProbe { head_len } => {
            counters::health_probes_total();
            health::respond(&mut stream, head_len).await?;
            Ok(None)
        }
        Preamble::Upgrade => {
            let ws_config = WebSocketConfig {
                max_message_size: Some(state.config.max_payload),
                max_frame_size: Some(state.config.max_payload),
                ..WebSocketConfig::default()
            };
            let ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await?;
            Ok(Some(ws))
        }
    }
}

/// Wait for the next text frame, answering pings along the way.
///
/// Returns `None` once the peer has closed the connection.
async fn next_text(ws_tx: &mut WsSink, ws_rx: &mut WsRecv) -> Result<Option<String>, SignalError> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text)),
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8(data).map_err(|_| {
                    SignalError::MalformedMessage("binary frame is not valid UTF-8".to_string())
                })?;
                return Ok(Some(text));
            }
            Some(Ok(Message::Ping(data))) => {
                if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                    debug!("failed to send pong: {}", e);
                }
            }
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(SignalError::WebSocket(e)),
        }
    }
}

/// Forward one payload from `role`'s connection to the opposite role.
///
/// Waits for room in the target's queue rather than dropping the frame.
/// While waiting, frames queued for this connection keep being written
/// out, so two peers relaying to each other always make progress. A
/// missing peer is reported back to the sender as `ERROR <text>`; the
/// sender stays connected.
///
/// Returns `Break` if shutdown fired while the frame was pending.
async fn relay(
    ws_tx: &mut WsSink,
    peer_rx: &mut mpsc::Receiver<Outbound>,
    text: &str,
    role: Role,
    conn_id: ConnId,
    state: &ServerState,
    shutdown: &mut watch::Receiver<()>,
) -> Result<ControlFlow<()>, SignalError> {
    let start = Instant::now();
    let payload = match Inbound::decode(text)? {
        Inbound::Payload(value) => value,
        Inbound::Role(declared) => {
            return Err(SignalError::MalformedMessage(format!(
                "role already declared as {role}, got {}",
                declared.token()
            )));
        }
    };

    let target = match state.registry.route(role, conn_id) {
        Ok(target) => target,
        Err(e @ SignalError::PeerUnavailable(_)) => {
            return report_unavailable(ws_tx, role, conn_id, e).await;
        }
        Err(e) => return Err(e),
    };

    loop {
        tokio::select! {
            permit = target.tx.reserve() => {
                let Ok(permit) = permit else {
                    let e = SignalError::PeerUnavailable(role.opposite());
                    return report_unavailable(ws_tx, role, conn_id, e).await;
                };
                permit.send(Outbound::Payload(payload));
                counters::messages_relayed_total(role);
                histograms::relay_latency_seconds(start.elapsed().as_secs_f64());
                debug!(conn_id, from = %role, to = target.conn_id, "relayed message");
                return Ok(ControlFlow::Continue(()));
            }
            outbound = peer_rx.recv() => {
                match outbound {
                    Some(out) => send_outbound(ws_tx, out).await?,
                    None => return Err(SignalError::Displaced(role)),
                }
            }
            _ = shutdown.changed() => {
                debug!(conn_id, %role, "shutdown while relay was pending");
                return Ok(ControlFlow::Break(()));
            }
        }
    }
}

async fn report_unavailable(
    ws_tx: &mut WsSink,
    role: Role,
    conn_id: ConnId,
    e: SignalError,
) -> Result<ControlFlow<()>, SignalError> {
    counters::relay_failures_total("peer_unavailable");
    warn!(conn_id, from = %role, "relay failed: {}", e);
    send_outbound(ws_tx, Outbound::Error(e.to_string())).await?;
    Ok(ControlFlow::Continue(()))
}

/// Put the connection into its role slot. Synchronous, so the slot is
/// claimed and guarded before anything is awaited.
fn claim(
    role: Role,
    conn_id: ConnId,
    peer_tx: mpsc::Sender<Outbound>,
    state: &ServerState,
) -> Result<Registration, SignalError> {
    let handle = PeerHandle {
        tx: peer_tx,
        conn_id,
    };
    match state.registry.register(role, handle) {
        Ok(registration) => {
            counters::registrations_total(role, "accepted");
            gauges::set_role_registered(role, true);
            info!(conn_id, %role, "{} connected", role);
            Ok(registration)
        }
        Err(e) => {
            counters::registrations_total(role, "duplicate");
            Err(e)
        }
    }
}

/// Emit the acknowledgment and any `READY` owed by a registration.
async fn announce(
    ws_tx: &mut WsSink,
    role: Role,
    conn_id: ConnId,
    registration: Registration,
) -> Result<(), SignalError> {
    if let Some(old) = registration.displaced {
        counters::registrations_total(role, "displaced");
        info!(conn_id, displaced = old.conn_id, %role, "previous {} connection replaced", role);
        // Dropping the last sender closes the displaced connection's queue
        drop(old);
    }

    send_outbound(ws_tx, Outbound::ack(role)).await?;

    if registration.ready_to_self {
        send_outbound(ws_tx, Outbound::Ready).await?;
        info!(conn_id, "both peers present, sent READY to robot");
    }

    if let Some(robot) = registration.notify_robot {
        // Queued behind any payloads already waiting for the robot
        match robot.tx.send(Outbound::Ready).await {
            Ok(()) => info!(robot = robot.conn_id, "both peers present, sent READY to robot"),
            Err(_) => debug!(robot = robot.conn_id, "robot left before READY was queued"),
        }
    }
    Ok(())
}

/// Drive one connection from its first frame until it closes.
async fn run_session(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    conn_id: ConnId,
    state: &ServerState,
    shutdown: &mut watch::Receiver<()>,
) -> Result<(), SignalError> {
    let first = tokio::select! {
        text = next_text(ws_tx, ws_rx) => text?,
        _ = shutdown.changed() => return Ok(()),
    };
    let Some(first) = first else {
        debug!(conn_id, "closed before declaring a role");
        return Ok(());
    };

    let role = match Inbound::decode(&first)? {
        Inbound::Role(role) => role,
        Inbound::Payload(_) => {
            return Err(SignalError::MalformedMessage(
                "first message must be ROBOT or CLIENT".to_string(),
            ));
        }
    };

    let (peer_tx, mut peer_rx) = mpsc::channel::<Outbound>(PEER_QUEUE);
    let registration = claim(role, conn_id, peer_tx, state)?;
    let _slot = SlotGuard::new(&state.registry, role, conn_id);
    announce(ws_tx, role, conn_id, registration).await?;

    loop {
        tokio::select! {
            text = next_text(ws_tx, ws_rx) => {
                match text? {
                    Some(text) => {
                        let flow =
                            relay(ws_tx, &mut peer_rx, &text, role, conn_id, state, shutdown)
                                .await?;
                        if flow.is_break() {
                            return Ok(());
                        }
                    }
                    None => {
                        info!(conn_id, %role, "{} disconnected", role);
                        return Ok(());
                    }
                }
            }
            outbound = peer_rx.recv() => {
                match outbound {
                    Some(out) => send_outbound(ws_tx, out).await?,
                    None => return Err(SignalError::Displaced(role)),
                }
            }
            _ = shutdown.changed() => {
                debug!(conn_id, %role, "cancelled by shutdown");
                return Ok(());
            }
        }
    }
}

/// Handle one accepted TCP connection until it ends or `shutdown` fires.
///
/// # Errors
///
/// Returns the error that ended the connection. The caller only logs it;
/// nothing here can affect other connections.
pub async fn handle_connection(
    stream: TcpStream,
    conn_id: ConnId,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), SignalError> {
    let accepted = tokio::select! {
        result = timeout(state.config.handshake_timeout(), accept(stream, &state)) => {
            result.map_err(|_| SignalError::HandshakeTimeout)??
        }
        _ = shutdown.changed() => return Ok(()),
    };
    let Some(ws_stream) = accepted else {
        debug!(conn_id, "answered health probe");
        return Ok(());
    };

    let _active = ActiveConnection::enter();
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let result = run_session(&mut ws_tx, &mut ws_rx, conn_id, &state, &mut shutdown).await;

    if matches!(result, Err(SignalError::DuplicateRole)) {
        let _ = send_outbound(&mut ws_tx, Outbound::Error(DUPLICATE_ROBOT_TEXT.to_string())).await;
    }
    // Best-effort close; the peer may already be gone
    let _ = ws_tx.close().await;

    result
}

/// Log how a connection ended, at a level matching the error kind.
pub fn log_outcome(conn_id: ConnId, addr: SocketAddr, result: &Result<(), SignalError>) {
    match result {
        Ok(()) => debug!(conn_id, %addr, "connection finished"),
        Err(e) if e.is_disconnect() => info!(conn_id, %addr, "connection closed"),
        Err(e @ SignalError::Displaced(_)) => info!(conn_id, %addr, "{}", e),
        Err(e @ SignalError::DuplicateRole) => {
            warn!(conn_id, %addr, "rejected registration: {}", e);
        }
        Err(e @ (SignalError::MalformedMessage(_) | SignalError::HandshakeTimeout)) => {
            warn!(conn_id, %addr, "closing connection: {}", e);
        }
        Err(e) => error!(conn_id, %addr, error = ?e, "connection failed: {}", e),
    }
}
