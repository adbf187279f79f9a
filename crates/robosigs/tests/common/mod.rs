#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use robosig_common::Role;
use robosigs::config::ServerConfig;
use robosigs::server::ServerState;
use robosigs::session::SessionSnapshot;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    test_config_with_params(listen, 64, 5)
}

pub fn test_config_with_params(
    listen: SocketAddr,
    max_conns: usize,
    handshake_timeout: u64,
) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: None,
        max_conns,
        max_payload: 1_048_576,
        handshake_timeout,
        drain_timeout: 2,
    }
}

type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type PeerSink = futures_util::stream::SplitSink<ClientWs, Message>;
pub type PeerStream = futures_util::stream::SplitStream<ClientWs>;

/// Send every value in order as a text frame.
pub async fn send_all(ws_tx: &mut PeerSink, values: &[Value]) {
    for value in values {
        ws_tx.send(Message::Text(value.to_string())).await.unwrap();
    }
}

/// Receive `n` JSON text frames.
pub async fn recv_json_n(ws_rx: &mut PeerStream, n: usize) -> Vec<Value> {
    let mut received = Vec::with_capacity(n);
    while received.len() < n {
        let text = next_text(ws_rx, RECV_TIMEOUT)
            .await
            .unwrap_or_else(|| panic!("timeout after {} of {n} frames", received.len()));
        let value = serde_json::from_str(&text)
            .unwrap_or_else(|e| panic!("expected JSON, got {text:?}: {e}"));
        received.push(value);
    }
    received
}

/// ICE candidate documents padded to roughly `size` bytes each.
pub fn padded_candidates(count: usize, size: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            let candidate = format!("candidate:{i} 1 UDP 2122 10.0.0.1 {} typ host ", 40_000 + i);
            let padding = "x".repeat(size.saturating_sub(candidate.len()));
            serde_json::json!({"ice": {"candidate": candidate + &padding, "sdpMLineIndex": 0}})
        })
        .collect()
}

/// Next text frame, or `None` if nothing arrives in time.
pub async fn next_text(ws_rx: &mut PeerStream, timeout: Duration) -> Option<String> {
    let next = async {
        loop {
            match ws_rx.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    };
    tokio::time::timeout(timeout, next).await.ok()
}

pub struct TestPeer {
    pub ws_tx: PeerSink,
    pub ws_rx: PeerStream,
}

impl TestPeer {
    pub async fn connect(addr: &SocketAddr) -> Self {
        let url = format!("ws://{addr}/");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    /// Connect, declare `role`, and consume the acknowledgment.
    pub async fn register(addr: &SocketAddr, role: Role) -> Self {
        let mut peer = Self::connect(addr).await;
        peer.send_text(role.token()).await;
        assert_eq!(peer.recv_text().await, role.ack());
        peer
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_binary(&mut self, data: Vec<u8>) {
        self.ws_tx.send(Message::Binary(data)).await.unwrap();
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.send_text(&value.to_string()).await;
    }

    pub async fn recv_text(&mut self) -> String {
        self.recv_text_timeout(RECV_TIMEOUT)
            .await
            .expect("timeout waiting for text frame")
    }

    pub async fn recv_json(&mut self) -> Value {
        let text = self.recv_text().await;
        serde_json::from_str(&text).unwrap_or_else(|e| panic!("expected JSON, got {text:?}: {e}"))
    }

    /// Next text frame, or `None` if nothing arrives in time.
    pub async fn recv_text_timeout(&mut self, timeout: Duration) -> Option<String> {
        next_text(&mut self.ws_rx, timeout).await
    }

    /// Assert that no text frame arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(msg) = tokio::time::timeout(window, self.ws_rx.next()).await {
            match msg {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                other => panic!("expected silence, got {other:?}"),
            }
        }
    }

    /// Assert the server closes the connection, skipping any text frames
    /// it sends first. Returns those frames.
    pub async fn expect_closed(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        let closed = tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                match self.ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => texts.push(text),
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "connection was not closed, got {texts:?}");
        texts
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(test_config).await
    }

    /// Start with a configuration built for the bound address.
    pub async fn start_with<F>(make_config: F) -> Self
    where
        F: FnOnce(SocketAddr) -> ServerConfig,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::new(make_config(addr)));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state_clone = state.clone();
        let handle = tokio::spawn(async move {
            let signal = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = robosigs::run_with_shutdown(listener, state_clone, signal).await {
                eprintln!("server error in test: {e}");
            }
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.registry.snapshot()
    }

    /// Poll the registry until `pred` holds.
    pub async fn wait_for<F>(&self, pred: F) -> SessionSnapshot
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let result = tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                let snap = self.snapshot();
                if pred(&snap) {
                    return snap;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        result.unwrap_or_else(|_| panic!("registry never reached the expected state: {:?}", self.snapshot()))
    }

    /// Trigger shutdown and wait for the accept loop to return.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("server did not shut down")
                .unwrap();
        }
    }
}
