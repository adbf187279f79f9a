//! robosig signaling server: pairs one robot with one client and relays
//! their WebRTC negotiation messages.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for signaling connections.
pub mod error;
/// Health probe answered on the signaling port.
pub mod health;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Accept loop, shared server state and shutdown.
pub mod server;
/// Robot/client role registry.
pub mod session;

pub use server::{run, run_with_shutdown, ServerState};
