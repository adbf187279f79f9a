//! Peer side of the signaling protocol.
//!
//! A [`SignalingLink`] is obtained by [`connect`], which declares the role
//! and waits for the server's acknowledgment. [`SignalingLink::run`] then
//! bridges a line-oriented local channel (stdin/stdout in the binary) with
//! the server until either side ends.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use robosig_common::{DecodeError, Inbound, Role, ServerEvent, SignalPayload};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors that end a signaling session.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The server sent `ERROR <text>`.
    #[error("server reported: {0}")]
    Server(String),
    /// The WebSocket failed.
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    /// The server did not acknowledge the declared role.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Reading input or writing output failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// An output event could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One line written to the local output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PeerEvent {
    /// Both roles are present; the robot may start negotiating.
    Ready,
    /// A payload relayed from the opposite peer.
    Signal {
        /// The JSON document as received.
        payload: Value,
    },
}

impl PeerEvent {
    /// Encode as a single output line, newline included.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error if the event cannot be encoded.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Validate one input line as a signaling payload.
///
/// Returns `Ok(None)` for blank lines.
///
/// # Errors
///
/// Returns a [`DecodeError`] if the line is not JSON or is neither an
/// `sdp` nor an `ice` document.
pub fn parse_line(line: &str) -> Result<Option<SignalPayload>, DecodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(line)?;
    SignalPayload::from_value(&value).map(Some)
}

/// A registered connection to the signaling server.
pub struct SignalingLink {
    role: Role,
    ws_tx: SplitSink<Ws, Message>,
    ws_rx: SplitStream<Ws>,
}

/// Connect to `url`, declare `role`, and wait for the acknowledgment.
///
/// # Errors
///
/// Returns [`PeerError::Server`] if the server rejects the role (for
/// example a second robot), [`PeerError::Handshake`] on any other reply,
/// or [`PeerError::Transport`] if the connection fails.
pub async fn connect(url: &str, role: Role) -> Result<SignalingLink, PeerError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    ws_tx.send(Message::Text(Inbound::Role(role).encode())).await?;
    debug!(%role, "role declared, waiting for acknowledgment");

    let reply = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | None => {
                return Err(PeerError::Handshake(
                    "connection closed before acknowledgment".to_string(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };

    match ServerEvent::decode(&reply) {
        Ok(ServerEvent::Ack(acked)) if acked == role => {
            info!(%role, "registered with signaling server");
            Ok(SignalingLink { role, ws_tx, ws_rx })
        }
        Ok(ServerEvent::Error(text)) => Err(PeerError::Server(text)),
        _ => Err(PeerError::Handshake(format!(
            "expected {}, got {reply:?}",
            role.ack()
        ))),
    }
}

impl SignalingLink {
    /// The role this link was registered as.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Relay between the local channel and the server.
    ///
    /// Each input line must be an `sdp` or `ice` document; invalid lines are
    /// logged and skipped. Every `READY` and relayed payload is written to
    /// `output` as one [`PeerEvent`] line. Returns `Ok(())` when the server
    /// closes the connection or `input` reaches EOF.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::Server`] when the server sends `ERROR`, and
    /// transport or I/O errors otherwise.
    pub async fn run<R, W>(mut self, input: R, mut output: W) -> Result<(), PeerError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("input closed, leaving session");
                        let _ = self.ws_tx.close().await;
                        return Ok(());
                    };
                    match parse_line(&line) {
                        Ok(Some(payload)) => {
                            let text = payload.to_value().to_string();
                            self.ws_tx.send(Message::Text(text)).await?;
                            debug!(role = %self.role, "sent signaling payload");
                        }
                        Ok(None) => {}
                        Err(e) => warn!("skipping input line: {}", e),
                    }
                }
                msg = self.ws_rx.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            info!("server closed the connection");
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e.into()),
                    };
                    if let Some(event) = self.on_server_text(&text)? {
                        output.write_all(event.to_line()?.as_bytes()).await?;
                        output.flush().await?;
                    }
                }
            }
        }
    }

    fn on_server_text(&self, text: &str) -> Result<Option<PeerEvent>, PeerError> {
        match ServerEvent::decode(text) {
            Ok(ServerEvent::Ready) => {
                info!("peer present, session ready");
                Ok(Some(PeerEvent::Ready))
            }
            Ok(ServerEvent::Payload(payload)) => {
                if let Err(e) = SignalPayload::from_value(&payload) {
                    debug!("relayed payload has an unknown shape: {}", e);
                }
                Ok(Some(PeerEvent::Signal { payload }))
            }
            Ok(ServerEvent::Error(text)) => Err(PeerError::Server(text)),
            Ok(ServerEvent::Ack(role)) => {
                debug!(%role, "ignoring repeated acknowledgment");
                Ok(None)
            }
            Err(e) => {
                warn!("ignoring unreadable server message: {}", e);
                Ok(None)
            }
        }
    }
}
