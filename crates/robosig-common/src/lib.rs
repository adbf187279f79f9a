//! Wire vocabulary shared by the robosig signaling server and its peers.
//!
//! This crate provides:
//! - Role and control-token definitions ([`types`])
//! - Boundary decoding/encoding of text frames and typed signaling
//!   payloads ([`message`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod message;
pub mod types;

pub use message::{DecodeError, Inbound, Outbound, ServerEvent, SignalPayload};
pub use types::Role;
