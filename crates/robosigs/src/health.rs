//! Liveness probe answered on the signaling port itself.
//!
//! The HTTP request head is peeked, not read, so a normal WebSocket upgrade
//! still sees the untouched stream. Only a `GET` for the health path is
//! consumed and answered here.

use crate::error::SignalError;
use robosig_common::types::{HEALTH_BODY, HEALTH_PATH};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on the request head we are willing to buffer while peeking.
const MAX_HEAD: usize = 8 * 1024;

/// Pause between peeks while the head is still arriving.
const PEEK_BACKOFF: Duration = Duration::from_millis(5);

/// What the start of an accepted stream turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    /// `GET /health`; the head spans `head_len` bytes.
    HealthProbe {
        /// Length of the request head including the blank line.
        head_len: usize,
    },
    /// Anything else; hand the stream to the WebSocket handshake.
    Upgrade,
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Whether a request line targets the health path with `GET`.
#[must_use]
pub fn is_health_request(request_line: &[u8]) -> bool {
    let Ok(line) = std::str::from_utf8(request_line) else {
        return false;
    };
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return false;
    };
    let path = target.split('?').next().unwrap_or(target);
    method == "GET" && path == HEALTH_PATH
}

/// Classify a (possibly partial) request head.
///
/// Returns `None` while more bytes are needed to decide.
#[must_use]
pub fn classify(head: &[u8]) -> Option<Preamble> {
    let line_end = find_subslice(head, b"\r\n")?;
    if !is_health_request(&head[..line_end]) {
        return Some(Preamble::Upgrade);
    }
    let head_end = find_subslice(head, b"\r\n\r\n")?;
    Some(Preamble::HealthProbe {
        head_len: head_end + 4,
    })
}

/// Peek at the stream until it can be classified.
///
/// # Errors
///
/// Returns [`SignalError::ConnectionClosed`] if the peer closes before
/// sending a request line, or an I/O error from the socket.
pub async fn sniff(stream: &TcpStream) -> Result<Preamble, SignalError> {
    let mut buf = vec![0u8; MAX_HEAD];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Err(SignalError::ConnectionClosed);
        }
        if let Some(preamble) = classify(&buf[..n]) {
            return Ok(preamble);
        }
        if n == buf.len() {
            // Oversized head; let the handshake reject it
            return Ok(Preamble::Upgrade);
        }
        // peek only waits while the buffer is empty; once a partial head
        // is buffered it returns at once, hence the pause
        tokio::time::sleep(PEEK_BACKOFF).await;
    }
}

/// Consume the probe's request head and answer `200 OK` with [`HEALTH_BODY`].
///
/// # Errors
///
/// Returns an I/O error if the socket fails mid-response.
pub async fn respond(stream: &mut TcpStream, head_len: usize) -> Result<(), SignalError> {
    let mut head = vec![0u8; head_len];
    stream.read_exact(&mut head).await?;

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        HEALTH_BODY.len(),
        HEALTH_BODY
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
