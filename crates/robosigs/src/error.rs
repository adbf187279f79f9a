use robosig_common::{DecodeError, Role};
use thiserror::Error;

/// Errors that can end a signaling connection.
#[derive(Error, Debug)]
pub enum SignalError {
    /// A robot tried to register while another robot is registered.
    #[error("a robot is already registered")]
    DuplicateRole,
    /// A frame was neither a role declaration nor well-formed JSON, or a
    /// role was declared at the wrong point of the conversation.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// A relay was attempted while the opposite role had no connection.
    #[error("peer unavailable: {0} is not connected")]
    PeerUnavailable(Role),
    /// A newer connection took over this connection's role slot.
    #[error("replaced by a newer {0} connection")]
    Displaced(Role),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// The HTTP preamble or WebSocket upgrade did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DecodeError> for SignalError {
    fn from(e: DecodeError) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}

impl SignalError {
    /// Whether the error is an ordinary end of conversation rather than
    /// a failure worth reporting above info level.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::WebSocket(e) => matches!(
                e,
                tungstenite::Error::ConnectionClosed
                    | tungstenite::Error::AlreadyClosed
                    | tungstenite::Error::Protocol(
                        tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
                    )
            ),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
