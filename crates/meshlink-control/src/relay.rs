//! Relay
//!
//! Store-and-forward of opaque frames between nodes that cannot reach each
//! other directly. Clients connect over WebSocket with their public key in
//! the `X-Node-Key` header; inbound frames are `[32B destination key |
//! payload]` and are delivered to the destination as `[32B sender key |
//! payload]`. The payload is never inspected.
//!
//! Each registered connection owns a dedicated writer task fed by a bounded
//! queue, so a destination socket always has exactly one writer. At most one
//! connection is registered per key; re-registration closes the prior one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use meshlink_types::{PublicKey, KEY_LEN};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Outbound frames queued per destination before drops kick in
const FRAME_QUEUE: usize = 64;

/// Admission predicate injected by the coordinator after construction
pub type KeyVerifier = Arc<dyn Fn(PublicKey) -> BoxFuture<'static, bool> + Send + Sync>;

/// Per-key WebSocket registry
pub struct Relay {
    conns: DashMap<PublicKey, RelayEntry>,
    next_conn_id: AtomicU64,
    verify_key: RwLock<Option<KeyVerifier>>,
}

struct RelayEntry {
    id: u64,
    tx: mpsc::Sender<Message>,
    closed: Arc<Notify>,
}

impl Relay {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            verify_key: RwLock::new(None),
        }
    }

    /// Install the admission predicate; connections are rejected until set
    pub fn set_key_verifier(&self, verifier: KeyVerifier) {
        *self.verify_key.write().expect("verifier lock poisoned") = Some(verifier);
    }

    async fn verify(&self, key: PublicKey) -> bool {
        let verify = self
            .verify_key
            .read()
            .expect("verifier lock poisoned")
            .clone();
        match verify {
            Some(verify) => verify(key).await,
            None => false,
        }
    }

    /// Number of registered connections (test hook)
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Close every registered connection and clear the registry
    pub fn close(&self) {
        for entry in self.conns.iter() {
            entry.closed.notify_one();
        }
        self.conns.clear();
    }

    async fn handle_socket(self: Arc<Self>, key: PublicKey, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(FRAME_QUEUE);
        let closed = Arc::new(Notify::new());
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        // single writer for this socket; runs until its queue sender is dropped
        let _writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        info!(%key, conn = id, "registering relay connection");
        if let Some(prev) = self.conns.insert(
            key,
            RelayEntry {
                id,
                tx,
                closed: closed.clone(),
            },
        ) {
            info!(%key, "closing existing relay connection for key");
            prev.closed.notify_one();
        }

        loop {
            tokio::select! {
                _ = closed.notified() => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Binary(frame))) => self.forward(&key, frame),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // text/ping/pong are not relay frames
                    Some(Err(err)) => {
                        debug!(%key, error = %err, "relay read error");
                        break;
                    }
                },
            }
        }

        // deregister only if our registration is still the installed one
        let removed = self.conns.remove_if(&key, |_, entry| entry.id == id).is_some();
        if removed {
            info!(%key, conn = id, "deregistered relay connection");
        }
    }

    fn forward(&self, src: &PublicKey, frame: Vec<u8>) {
        if frame.len() < KEY_LEN {
            debug!(%src, len = frame.len(), "dropping short relay frame");
            return;
        }
        let Ok(dst) = PublicKey::try_from_slice(&frame[..KEY_LEN]) else {
            return;
        };

        let Some(entry) = self.conns.get(&dst) else {
            debug!(%src, %dst, "no relay connection for destination, dropping frame");
            return;
        };

        let mut packet = Vec::with_capacity(frame.len());
        packet.extend_from_slice(&src.raw());
        packet.extend_from_slice(&frame[KEY_LEN..]);

        if entry.tx.try_send(Message::Binary(packet)).is_err() {
            warn!(%dst, "relay queue full or closing, dropping frame");
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

/// Router exposing the `/relay` WebSocket upgrade (GET or POST)
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/relay", get(handle_relay).post(handle_relay))
        .with_state(relay)
}

async fn handle_relay(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let key = headers
        .get("x-node-key")
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.parse::<PublicKey>().ok());
    let Some(key) = key else {
        return (StatusCode::BAD_REQUEST, "missing or invalid node key header").into_response();
    };

    if !relay.verify(key).await {
        return (StatusCode::UNAUTHORIZED, "node key rejected").into_response();
    }

    // key validation runs for both methods; whether the request can
    // actually switch protocols is decided by the upgrade itself
    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "not a websocket handshake").into_response();
    };

    ws.on_upgrade(move |socket| relay.handle_socket(key, socket))
}
