//! UDP Socket Multiplexer
//!
//! Owns the node's single UDP socket and fans it out across per-peer
//! sessions. The read loop classifies each datagram as a STUN response, a
//! probe, or peer data (demuxed by source address with a single-slot cache);
//! a timer refreshes the reflexive address every few seconds; the relay
//! attachment carries exchange traffic and fallback data frames addressed by
//! public key.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshlink_types::{probe, stun, Probe, ProbeType, PublicKey, KEY_LEN};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::conn::Conn;
use crate::error::{NetError, NetResult};
use crate::netutil;
use crate::relay_client::RelayClient;

/// Cadence of periodic reflexive address refresh
pub const STUN_PERIOD: Duration = Duration::from_secs(10);

/// Public STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Largest datagram the read loop accepts
pub const MAX_MTU: usize = 1400;

const INBOUND_QUEUE: usize = 256;

/// A payload received from a peer, headed for the tunnel layer
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub peer_id: u64,
    pub payload: Vec<u8>,
}

/// Point-in-time transport counters
#[derive(Debug, Clone, Copy, Default)]
pub struct MuxStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub stun_requests: u64,
    pub cache_hits: u64,
    pub conns: usize,
}

#[derive(Default)]
struct Counters {
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    stun_requests: AtomicU64,
    cache_hits: AtomicU64,
}

/// The node's transport multiplexer
pub struct Mux {
    node_id: u64,
    node_key: PublicKey,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    listen_endpoints: Vec<SocketAddr>,
    stun_server: Option<SocketAddr>,
    relay: RelayClient,
    inbound: mpsc::Sender<InboundPacket>,
    state: Mutex<MuxState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
    closed: AtomicBool,
}

#[derive(Default)]
struct MuxState {
    reflexive_addr: Option<SocketAddr>,
    conns_by_id: HashMap<u64, Arc<Conn>>,
    conns_by_key: HashMap<PublicKey, Arc<Conn>>,
    addr_to_conn: HashMap<SocketAddr, Arc<Conn>>,
}

impl Mux {
    /// Take ownership of `socket` and start the read loop, the STUN timer,
    /// and the relay attachment. Inbound peer payloads are delivered on the
    /// returned channel.
    pub async fn new(
        node_id: u64,
        node_key: PublicKey,
        socket: UdpSocket,
        relay_url: &str,
        stun_server: &str,
    ) -> NetResult<(Arc<Self>, mpsc::Receiver<InboundPacket>)> {
        let local_addr = socket.local_addr()?;

        let listen_endpoints = if local_addr.ip().is_unspecified() {
            netutil::local_endpoints(local_addr.port()).await
        } else {
            vec![local_addr]
        };

        let stun_addr = match tokio::net::lookup_host(stun_server).await {
            Ok(mut addrs) => addrs.find(|a| a.is_ipv4()),
            Err(err) => {
                warn!(server = stun_server, error = %err, "stun server resolution failed");
                None
            }
        };
        if stun_addr.is_none() {
            warn!(server = stun_server, "no usable stun server, reflexive discovery disabled");
        }

        let relay = RelayClient::new(relay_url, node_key)?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let mux = Arc::new(Self {
            node_id,
            node_key,
            socket: Arc::new(socket),
            local_addr,
            listen_endpoints,
            stun_server: stun_addr,
            relay,
            inbound: inbound_tx,
            state: Mutex::new(MuxState::default()),
            tasks: Mutex::new(Vec::new()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
        });

        let read_task = tokio::spawn(Arc::clone(&mux).read_loop());
        let stun_task = tokio::spawn(Arc::clone(&mux).stun_loop());
        let relay_task = tokio::spawn(Arc::clone(&mux).relay_loop());
        mux.tasks
            .lock()
            .expect("task lock poisoned")
            .extend([read_task, stun_task, relay_task]);

        info!(node_id, addr = %local_addr, "mux started");
        Ok((mux, inbound_rx))
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn node_key(&self) -> PublicKey {
        self.node_key
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Local interface endpoints; falls back to the socket's own address
    pub fn listen_addresses(&self) -> Vec<SocketAddr> {
        if self.listen_endpoints.is_empty() {
            vec![self.local_addr]
        } else {
            self.listen_endpoints.clone()
        }
    }

    /// Latest reflexive address learned from STUN
    pub fn reflexive_addr(&self) -> Option<SocketAddr> {
        self.lock_state().reflexive_addr
    }

    /// Whether the relay attachment currently has a live connection
    pub fn relay_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Snapshot of the transport counters
    pub fn stats(&self) -> MuxStats {
        MuxStats {
            rx_bytes: self.counters.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.counters.tx_bytes.load(Ordering::Relaxed),
            stun_requests: self.counters.stun_requests.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            conns: self.lock_state().conns_by_id.len(),
        }
    }

    /// Everything a peer might reach us at: interface endpoints plus the
    /// reflexive address when known
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        let mut endpoints = self.listen_addresses();
        if let Some(reflexive) = self.reflexive_addr() {
            if !endpoints.contains(&reflexive) {
                endpoints.push(reflexive);
            }
        }
        endpoints
    }

    /// Fetch the live session for a peer, creating one on first use
    ///
    /// A key change for an existing peer id closes the old session and
    /// starts a fresh one.
    pub fn get_conn(self: &Arc<Self>, peer_id: u64, peer_key: PublicKey) -> NetResult<Arc<Conn>> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }

        let replaced;
        let conn = {
            let mut state = self.lock_state();
            if let Some(existing) = state.conns_by_id.get(&peer_id) {
                if !existing.is_closed() && existing.public_key() == peer_key {
                    return Ok(Arc::clone(existing));
                }
            }

            replaced = Self::detach_conn_locked(&mut state, |c| c.peer_id() == peer_id);
            let conn = Arc::new(Conn::new(Arc::clone(self), peer_id, peer_key));
            state.conns_by_id.insert(peer_id, Arc::clone(&conn));
            state.conns_by_key.insert(peer_key, Arc::clone(&conn));
            conn
        };

        if let Some(old) = replaced {
            debug!(peer_id, "replacing session after key change");
            old.close();
        }
        info!(peer_id, key = %peer_key, "created peer connection");
        Ok(conn)
    }

    /// Close and forget the session registered under `peer_key`
    pub fn remove_conn(&self, peer_key: &PublicKey) {
        let removed = {
            let mut state = self.lock_state();
            Self::detach_conn_locked(&mut state, |c| c.public_key() == *peer_key)
        };
        if let Some(conn) = removed {
            info!(peer_id = conn.peer_id(), "removed peer connection");
            conn.close();
        }
    }

    /// Unlink one session from every map; the caller closes it after the
    /// registry lock is released (conn lock is ordered before mux lock)
    fn detach_conn_locked(
        state: &mut MuxState,
        matches: impl Fn(&Conn) -> bool,
    ) -> Option<Arc<Conn>> {
        let conn = state
            .conns_by_key
            .values()
            .find(|c| matches(c.as_ref()))
            .cloned()?;
        state.conns_by_key.retain(|_, c| !Arc::ptr_eq(c, &conn));
        state.conns_by_id.retain(|_, c| !Arc::ptr_eq(c, &conn));
        state.addr_to_conn.retain(|_, c| !Arc::ptr_eq(c, &conn));
        Some(conn)
    }

    /// Record `addr` as the demux source for `conn` (called on promotion)
    pub(crate) fn register_conn_addr(&self, addr: SocketAddr, conn: &Arc<Conn>) {
        let mut state = self.lock_state();
        state.addr_to_conn.insert(addr, Arc::clone(conn));
    }

    /// Async datagram send used by the data path
    pub(crate) async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> NetResult<()> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        self.socket.send_to(buf, addr).await?;
        self.counters.tx_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Non-blocking datagram send safe to call under session locks
    pub(crate) fn try_write_to(&self, buf: &[u8], addr: SocketAddr) -> NetResult<()> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }
        self.socket.try_send_to(buf, addr)?;
        self.counters.tx_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Queue a frame for the relay
    pub(crate) fn relay_send(&self, packet: Vec<u8>) -> NetResult<()> {
        self.relay.send(packet)
    }

    /// Hand an inbound peer payload to the tunnel layer
    pub(crate) fn deliver(&self, peer_id: u64, payload: &[u8]) {
        let packet = InboundPacket {
            peer_id,
            payload: payload.to_vec(),
        };
        if self.inbound.try_send(packet).is_err() {
            warn!(peer_id, "inbound queue full, dropping packet");
        }
    }

    /// Fire a binding request at the configured STUN server; the response
    /// lands in the read loop and updates the reflexive address
    pub fn stun(&self) {
        let Some(server) = self.stun_server else {
            return;
        };
        let request = stun::binding_request(&stun::new_transaction_id());
        self.counters.stun_requests.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.try_write_to(&request, server) {
            debug!(error = %err, "error sending stun request");
        }
    }

    /// Idempotent shutdown: stops all tasks, closes the relay client and
    /// every session, and releases the socket
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(node_id = self.node_id, "closing mux");

        self.relay.close();

        let conns: Vec<Arc<Conn>> = {
            let mut state = self.lock_state();
            state.addr_to_conn.clear();
            state.conns_by_id.clear();
            state.conns_by_key.drain().map(|(_, c)| c).collect()
        };
        for conn in conns {
            conn.close();
        }

        for task in self.tasks.lock().expect("task lock poisoned").drain(..) {
            task.abort();
        }
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = [0u8; MAX_MTU];
        let mut cached: Option<(SocketAddr, Arc<Conn>)> = None;

        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(err) => {
                    if !self.is_closed() {
                        warn!(error = %err, "udp read failed, stopping mux");
                        self.close();
                    }
                    return;
                }
            };
            let data = &buf[..len];
            self.counters.rx_bytes.fetch_add(len as u64, Ordering::Relaxed);

            if stun::is_message(data) {
                self.handle_stun(data);
                continue;
            }
            if probe::is_probe(data) {
                self.handle_probe(data, src);
                continue;
            }

            // data path: demux by source address with a single-slot cache
            let conn = match &cached {
                Some((addr, conn)) if *addr == src && !conn.is_closed() => {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    Some(Arc::clone(conn))
                }
                _ => {
                    let looked_up = self.lock_state().addr_to_conn.get(&src).cloned();
                    if let Some(conn) = &looked_up {
                        cached = Some((src, Arc::clone(conn)));
                    }
                    looked_up
                }
            };

            match conn {
                Some(conn) => conn.receive(data),
                None => debug!(%src, "dropping datagram from unknown endpoint"),
            }
        }
    }

    fn handle_stun(&self, data: &[u8]) {
        let mapped = match stun::parse_binding_success(data) {
            Ok(addr) => addr,
            Err(err) => {
                debug!(error = %err, "ignoring stun message");
                return;
            }
        };

        let mut state = self.lock_state();
        if state.reflexive_addr != Some(mapped) {
            info!(addr = %mapped, "reflexive address updated");
            state.reflexive_addr = Some(mapped);
        }
    }

    fn handle_probe(self: &Arc<Self>, data: &[u8], src: SocketAddr) {
        let probe = match Probe::decode(data) {
            Ok(probe) => probe,
            Err(err) => {
                debug!(%src, error = %err, "error decoding probe message");
                return;
            }
        };

        let conn = self.lock_state().conns_by_id.get(&probe.node_id).cloned();
        let Some(conn) = conn else {
            debug!(node_id = probe.node_id, %src, "probe for unknown node id");
            return;
        };

        match probe.kind {
            ProbeType::Ping => {
                conn.add_candidate_from_ping(src);
                self.pong_reply(probe.tx_id, src);
            }
            ProbeType::Pong => conn.handle_pong(&probe, src),
            other => debug!(?other, %src, "unexpected probe type on data socket"),
        }
    }

    fn pong_reply(&self, tx_id: u64, src: SocketAddr) {
        let pong = Probe {
            node_id: self.node_id,
            tx_id,
            kind: ProbeType::Pong,
            endpoint: Some(src),
            endpoints: None,
        };
        match pong.encode() {
            Ok(buf) => {
                if let Err(err) = self.try_write_to(&buf, src) {
                    debug!(%src, error = %err, "error writing pong");
                }
            }
            Err(err) => warn!(error = %err, "error encoding pong"),
        }
    }

    /// Dispatch frames arriving over the relay: `[32B sender key | payload]`
    async fn relay_loop(self: Arc<Self>) {
        loop {
            let frame = match self.relay.recv().await {
                Ok(frame) => frame,
                Err(_) => return, // relay client closed
            };

            if frame.len() < KEY_LEN {
                debug!(len = frame.len(), "dropping short relay frame");
                continue;
            }
            let Ok(src_key) = PublicKey::try_from_slice(&frame[..KEY_LEN]) else {
                continue;
            };
            let payload = &frame[KEY_LEN..];

            let conn = self.lock_state().conns_by_key.get(&src_key).cloned();
            let Some(conn) = conn else {
                debug!(key = %src_key, "relay frame from unknown peer");
                continue;
            };

            if !probe::is_probe(payload) {
                conn.receive(payload);
                continue;
            }

            match Probe::decode(payload) {
                Ok(probe) => match probe.kind {
                    ProbeType::Call => conn.handle_call(),
                    ProbeType::EndpointRequest => {
                        conn.handle_endpoint_request(probe.endpoints.unwrap_or_default())
                    }
                    ProbeType::EndpointResponse => {
                        conn.handle_endpoint_response(probe.endpoints.unwrap_or_default())
                    }
                    other => debug!(?other, "unexpected probe type on relay path"),
                },
                Err(err) => debug!(error = %err, "error decoding relay probe"),
            }
        }
    }

    async fn stun_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(STUN_PERIOD);
        loop {
            ticker.tick().await;
            if self.is_closed() {
                return;
            }
            self.stun();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MuxState> {
        self.state.lock().expect("mux lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_types::PrivateKey;
    use std::time::Instant;

    // no relay or stun server behind these; the clients retry in the
    // background without affecting the direct path under test
    const DEAD_RELAY: &str = "http://127.0.0.1:1";
    const DEAD_STUN: &str = "127.0.0.1:1";

    async fn test_mux(node_id: u64) -> (Arc<Mux>, mpsc::Receiver<InboundPacket>, PublicKey) {
        let key = PrivateKey::generate().public();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (mux, inbound) = Mux::new(node_id, key, socket, DEAD_RELAY, DEAD_STUN)
            .await
            .unwrap();
        (mux, inbound, key)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_listen_addresses_fall_back_to_local() {
        let (mux, _inbound, _key) = test_mux(1).await;
        let addrs = mux.listen_addresses();
        assert_eq!(addrs, vec![mux.local_addr()]);
        assert_eq!(mux.endpoints(), addrs); // no reflexive address yet
        mux.close();
    }

    #[tokio::test]
    async fn test_get_conn_is_idempotent_and_rotation_replaces() {
        let (mux, _inbound, _key) = test_mux(1).await;
        let peer_key = PrivateKey::generate().public();

        let first = mux.get_conn(7, peer_key).unwrap();
        let again = mux.get_conn(7, peer_key).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        // same peer id under a rotated key: old session is closed out
        let rotated = PrivateKey::generate().public();
        let fresh = mux.get_conn(7, rotated).unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(first.is_closed());
        assert_eq!(mux.lock_state().conns_by_key.len(), 1);
        mux.close();
    }

    #[tokio::test]
    async fn test_write_without_candidates_stays_on_relay() {
        let (mux, _inbound, _key) = test_mux(1).await;
        let conn = mux.get_conn(2, PrivateKey::generate().public()).unwrap();

        conn.write(b"payload").await;
        assert_eq!(conn.send_addr(), None);
        mux.close();
    }

    #[tokio::test]
    async fn test_ping_pong_promotes_loopback_path() {
        let (mux_a, _inbound_a, key_a) = test_mux(1).await;
        let (mux_b, _inbound_b, key_b) = test_mux(2).await;

        let conn_a = mux_a.get_conn(2, key_b).unwrap();
        let _conn_b = mux_b.get_conn(1, key_a).unwrap();

        // first write marks the exchange; candidates then arrive as if a
        // peer had answered with its endpoint list
        conn_a.write(b"x").await;
        conn_a.handle_endpoint_response(vec![mux_b.local_addr()]);
        conn_a.write(b"x").await;

        wait_for("promotion to the loopback path", || {
            conn_a.send_addr() == Some(mux_b.local_addr())
        })
        .await;

        // the demux map points the promoted source at this session
        let mapped = mux_a
            .lock_state()
            .addr_to_conn
            .get(&mux_b.local_addr())
            .cloned();
        assert!(mapped.is_some_and(|c| Arc::ptr_eq(&c, &conn_a)));

        mux_a.close();
        mux_b.close();
    }

    #[tokio::test]
    async fn test_direct_data_is_delivered_upstream() {
        let (mux_a, _inbound_a, key_a) = test_mux(1).await;
        let (mux_b, mut inbound_b, key_b) = test_mux(2).await;

        let conn_a = mux_a.get_conn(2, key_b).unwrap();
        let conn_b = mux_b.get_conn(1, key_a).unwrap();

        // drive both sides to a promoted direct path
        conn_a.write(b"x").await;
        conn_a.handle_endpoint_response(vec![mux_b.local_addr()]);
        conn_a.write(b"x").await;
        conn_b.write(b"x").await;
        conn_b.handle_endpoint_response(vec![mux_a.local_addr()]);
        conn_b.write(b"x").await;

        wait_for("both sides promoted", || {
            conn_a.send_addr().is_some() && conn_b.send_addr().is_some()
        })
        .await;

        conn_a.write(b"direct payload").await;
        let packet = tokio::time::timeout(Duration::from_secs(2), inbound_b.recv())
            .await
            .expect("payload should arrive directly")
            .unwrap();
        assert_eq!(packet.peer_id, 1);
        assert_eq!(packet.payload, b"direct payload");

        let stats = mux_a.stats();
        assert_eq!(stats.conns, 1);
        assert!(stats.tx_bytes > 0);
        assert!(stats.rx_bytes > 0);

        mux_a.close();
        mux_b.close();
    }

    #[tokio::test]
    async fn test_remove_conn_purges_demux_entries() {
        let (mux_a, _inbound_a, key_a) = test_mux(1).await;
        let (mux_b, _inbound_b, key_b) = test_mux(2).await;

        let conn_a = mux_a.get_conn(2, key_b).unwrap();
        let _conn_b = mux_b.get_conn(1, key_a).unwrap();

        conn_a.write(b"x").await;
        conn_a.handle_endpoint_response(vec![mux_b.local_addr()]);
        conn_a.write(b"x").await;
        wait_for("promotion", || conn_a.send_addr().is_some()).await;

        mux_a.remove_conn(&key_b);
        assert!(conn_a.is_closed());
        let state = mux_a.lock_state();
        assert!(state.addr_to_conn.is_empty());
        assert!(state.conns_by_id.is_empty());
        assert!(state.conns_by_key.is_empty());
        drop(state);

        mux_a.close();
        mux_b.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mux, _inbound, _key) = test_mux(1).await;
        let conn = mux.get_conn(2, PrivateKey::generate().public()).unwrap();
        mux.close();
        mux.close();
        assert!(mux.is_closed());
        assert!(conn.is_closed());
        assert!(matches!(
            mux.get_conn(3, PrivateKey::generate().public()),
            Err(NetError::Closed)
        ));
    }
}
