//! Signaling peer for the robosig relay.
//!
//! Declares a robot or client role, then bridges newline-delimited JSON on
//! a local channel with the server.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Command-line interface.
pub mod config;
/// Role handshake and relay loop.
pub mod signaling;

pub use signaling::{connect, PeerError, PeerEvent, SignalingLink};
