//! Text-frame vocabulary of the signaling protocol.
//!
//! Control tokens (`ROBOT`, `READY`, `ERROR ...`) and signaling payloads
//! (JSON documents) share a single text channel. They are told apart once,
//! here, and represented as tagged unions everywhere else.

use crate::types::{Role, CLIENT, CLIENT_OK, ERROR_PREFIX, READY, ROBOT, ROBOT_OK};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced while decoding a text frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The frame is neither a control token nor well-formed JSON.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame is JSON but not an `sdp` or `ice` document.
    #[error("not a signaling payload: {0}")]
    NotSignal(String),
}

/// A frame sent by a peer to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Role declaration (`ROBOT` or `CLIENT`).
    Role(Role),
    /// Opaque JSON payload to relay.
    Payload(Value),
}

impl Inbound {
    /// Decode a text frame received from a peer.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Json`] if the frame is not a role token and
    /// does not parse as JSON.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        match text {
            ROBOT => Ok(Self::Role(Role::Robot)),
            CLIENT => Ok(Self::Role(Role::Client)),
            _ => Ok(Self::Payload(serde_json::from_str(text)?)),
        }
    }

    /// Encode the frame as a peer would send it.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Role(role) => role.token().to_string(),
            Self::Payload(value) => value.to_string(),
        }
    }
}

/// A frame sent by the server to a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// `ROBOT_OK`
    RobotOk,
    /// `CLIENT_OK`
    ClientOk,
    /// `READY`
    Ready,
    /// `ERROR <text>`
    Error(String),
    /// Relayed JSON payload.
    Payload(Value),
}

impl Outbound {
    /// The acknowledgment for a freshly registered role.
    #[must_use]
    pub const fn ack(role: Role) -> Self {
        match role {
            Role::Robot => Self::RobotOk,
            Role::Client => Self::ClientOk,
        }
    }

    /// Encode as the text frame written to the socket.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::RobotOk => ROBOT_OK.to_string(),
            Self::ClientOk => CLIENT_OK.to_string(),
            Self::Ready => READY.to_string(),
            Self::Error(text) => format!("{ERROR_PREFIX} {text}"),
            Self::Payload(value) => value.to_string(),
        }
    }
}

/// A server frame as seen by a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Role accepted.
    Ack(Role),
    /// Both roles are present.
    Ready,
    /// Unrecoverable error reported by the server.
    Error(String),
    /// Payload relayed from the opposite peer.
    Payload(Value),
}

impl ServerEvent {
    /// Decode a text frame received from the server.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Json`] if the frame is not a known control
    /// token and does not parse as JSON.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        match text {
            ROBOT_OK => return Ok(Self::Ack(Role::Robot)),
            CLIENT_OK => return Ok(Self::Ack(Role::Client)),
            READY => return Ok(Self::Ready),
            _ => {}
        }
        if let Some(rest) = text.strip_prefix(ERROR_PREFIX) {
            if rest.is_empty() || rest.starts_with(' ') {
                return Ok(Self::Error(rest.trim_start().to_string()));
            }
        }
        Ok(Self::Payload(serde_json::from_str(text)?))
    }
}

/// Whether a session description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// SDP offer.
    Offer,
    /// SDP answer.
    Answer,
}

/// Body of an `{"sdp": ...}` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer.
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Raw SDP text.
    pub sdp: String,
}

/// Body of an `{"ice": ...}` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line.
    pub candidate: String,
    /// Index of the media line the candidate belongs to.
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u32,
}

/// Typed view of the two recognized signaling documents.
///
/// The server never needs this: it relays payloads as opaque JSON. Peers
/// use it to validate what they send and to dispatch what they receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalPayload {
    /// `{"sdp": {"type": ..., "sdp": ...}}`
    Sdp(SessionDescription),
    /// `{"ice": {"candidate": ..., "sdpMLineIndex": ...}}`
    Ice(IceCandidate),
}

impl SignalPayload {
    /// Interpret an opaque payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::NotSignal`] if the value has neither shape.
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Self::deserialize(value).map_err(|e| DecodeError::NotSignal(e.to_string()))
    }

    /// Convert back into the JSON document sent on the wire.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Sdp(desc) => serde_json::json!({
                "sdp": { "type": desc.kind, "sdp": desc.sdp }
            }),
            Self::Ice(ice) => serde_json::json!({
                "ice": { "candidate": ice.candidate, "sdpMLineIndex": ice.sdp_mline_index }
            }),
        }
    }
}
