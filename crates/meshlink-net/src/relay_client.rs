//! Relay Client
//!
//! Auto-reconnecting WebSocket to the server's `/relay` endpoint. A driver
//! task owns the socket: it dials with a short handshake timeout, retries
//! every couple of seconds until closed, pumps a bounded outbound queue into
//! the sink, and fans inbound binary frames out on a second queue. `send` is
//! non-blocking so callers may use it while holding locks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meshlink_types::PublicKey;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{NetError, NetResult};

/// WebSocket handshake deadline
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);

const QUEUE_DEPTH: usize = 128;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Auto-reconnecting relay attachment
pub struct RelayClient {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl RelayClient {
    /// Start the driver dialing `{ws|wss}://<host>/relay` derived from the
    /// server URL, authenticating with `node_key`
    pub fn new(server_url: &str, node_key: PublicKey) -> NetResult<Self> {
        let dial_url = relay_dial_url(server_url)?;
        info!(url = %dial_url, "relay dial address");

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let connected = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(drive(
            dial_url,
            node_key,
            outbound_rx,
            inbound_tx,
            connected.clone(),
            closed.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            connected,
            closed,
            shutdown,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue a binary frame for the relay; non-blocking
    pub fn send(&self, data: Vec<u8>) -> NetResult<()> {
        if !self.is_connected() {
            return Err(NetError::NotConnected);
        }
        self.outbound
            .try_send(data)
            .map_err(|_| NetError::NotConnected)
    }

    /// Receive the next inbound binary payload
    pub async fn recv(&self) -> NetResult<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(NetError::Closed)
    }

    /// Idempotent close; stops reconnecting and drops the current socket
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.shutdown.notify_one();
    }
}

/// Derive the websocket dial URL from the coordinator's base URL
fn relay_dial_url(server_url: &str) -> NetResult<String> {
    let (scheme, rest) = if let Some(rest) = server_url.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        ("ws", rest)
    } else {
        ("ws", server_url)
    };

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(NetError::InvalidUrl(server_url.to_string()));
    }
    Ok(format!("{scheme}://{host}/relay"))
}

async fn drive(
    dial_url: String,
    node_key: PublicKey,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    loop {
        if closed.load(Ordering::Acquire) {
            return;
        }

        let socket = tokio::select! {
            _ = shutdown.notified() => return,
            dialed = dial(&dial_url, &node_key) => match dialed {
                Some(socket) => socket,
                None => {
                    tokio::select! {
                        _ = shutdown.notified() => return,
                        _ = sleep(RECONNECT_DELAY) => continue,
                    }
                }
            },
        };

        info!("relay websocket connection established");
        connected.store(true, Ordering::Release);
        pump(socket, &mut outbound, &inbound, &shutdown).await;
        connected.store(false, Ordering::Release);

        if closed.load(Ordering::Acquire) {
            return;
        }
        debug!("relay connection lost, reconnecting");
        tokio::select! {
            _ = shutdown.notified() => return,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn dial(dial_url: &str, node_key: &PublicKey) -> Option<Socket> {
    let mut request = match dial_url.into_client_request() {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "relay dial url rejected");
            return None;
        }
    };
    let header = HeaderValue::from_str(&node_key.to_string()).ok()?;
    request.headers_mut().insert("x-node-key", header);

    match timeout(HANDSHAKE_TIMEOUT, connect_async(request)).await {
        Ok(Ok((socket, _response))) => Some(socket),
        Ok(Err(err)) => {
            debug!(error = %err, "error connecting to relay websocket");
            None
        }
        Err(_) => {
            debug!("relay websocket handshake timed out");
            None
        }
    }
}

/// Pump one live connection until it errors, closes, or shutdown fires
async fn pump(
    socket: Socket,
    outbound: &mut mpsc::Receiver<Vec<u8>>,
    inbound: &mpsc::Sender<Vec<u8>>,
    shutdown: &Notify,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                let _ = sink.close().await;
                return;
            }
            frame = outbound.recv() => match frame {
                Some(data) => {
                    if let Err(err) = sink.send(Message::Binary(data)).await {
                        debug!(error = %err, "relay write failed");
                        return;
                    }
                }
                None => return, // client dropped
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if inbound.try_send(data).is_err() {
                        warn!("inbound relay queue full, dropping frame");
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {} // text/ping/pong are not relay frames
                Some(Err(err)) => {
                    debug!(error = %err, "relay read error");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_types::PrivateKey;

    #[test]
    fn test_dial_url_from_server_url() {
        assert_eq!(
            relay_dial_url("http://127.0.0.1:8080").unwrap(),
            "ws://127.0.0.1:8080/relay"
        );
        assert_eq!(
            relay_dial_url("https://mesh.example.com/some/path").unwrap(),
            "wss://mesh.example.com/relay"
        );
        assert_eq!(
            relay_dial_url("127.0.0.1:8080").unwrap(),
            "ws://127.0.0.1:8080/relay"
        );
        assert!(relay_dial_url("http://").is_err());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_not_connected() {
        let client =
            RelayClient::new("http://127.0.0.1:1", PrivateKey::generate().public()).unwrap();
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(b"frame".to_vec()),
            Err(NetError::NotConnected)
        ));
        client.close();
        assert!(client.is_closed());
        client.close(); // idempotent
    }
}
