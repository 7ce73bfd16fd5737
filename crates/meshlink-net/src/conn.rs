//! Per-Peer Connection
//!
//! Tracks candidate endpoints for one peer, measures reachability and RTT
//! with ping/pong probes, selects the best direct path, and falls back to
//! the relay while no direct path is viable.
//!
//! All session state sits behind the connection's own mutex. The lock is
//! never held across an await: probe sends inside the lock go through the
//! mux's non-blocking senders, and the brief reflexive-refresh wait before
//! an endpoint exchange runs on a spawned task. Acquire order when both are
//! needed is this lock first, then the mux registry lock.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use meshlink_types::{Probe, ProbeType, PublicKey, KEY_LEN};
use tracing::{debug, info, warn};

use crate::mux::Mux;

/// Minimum spacing between pings to the same endpoint
pub const ENDPOINT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Re-probe interval after selecting a send address
pub const RECHECK_BEST: Duration = Duration::from_millis(5500);

/// Endpoints younger than this are never evicted
pub const ACTIVE_GRACE: Duration = Duration::from_secs(45);

/// A candidate whose last pong is older than this is stale
pub const PONG_SILENCE: Duration = Duration::from_secs(10);

/// Trigger a fresh endpoint exchange when the last one is older than this
pub const EXCHANGE_PERIOD: Duration = Duration::from_secs(120);

/// Pause after a STUN nudge before gathering endpoints for an exchange
const REFLEXIVE_SETTLE: Duration = Duration::from_millis(50);

/// Backoff before re-probing right after a promotion
const POST_PROMOTE_RECHECK: Duration = Duration::from_secs(2);

/// One candidate endpoint
struct Endpoint {
    addr: SocketAddr,
    last_ping: Option<Instant>,
    // None encodes "never responded"
    last_pong: Option<Instant>,
    rtt: Duration,
    active_since: Instant,
}

/// An outstanding ping awaiting its pong
struct SentPing {
    sent_at: Instant,
    addr: SocketAddr,
}

#[derive(Default)]
struct ConnState {
    send_addr: Option<SocketAddr>,
    recheck_best: Option<Instant>,
    last_exchange: Option<Instant>,
    pings: HashMap<u64, SentPing>,
    endpoints: HashMap<SocketAddr, Endpoint>,
}

/// Per-peer session owned by the mux
pub struct Conn {
    peer_id: u64,
    public_key: PublicKey,
    mux: Arc<Mux>,
    state: Mutex<ConnState>,
    closed: AtomicBool,
}

impl Conn {
    pub(crate) fn new(mux: Arc<Mux>, peer_id: u64, public_key: PublicKey) -> Self {
        Self {
            peer_id,
            public_key,
            mux,
            state: Mutex::new(ConnState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The currently selected direct path, if any (`None` means relay)
    pub fn send_addr(&self) -> Option<SocketAddr> {
        self.lock_state().send_addr
    }

    /// Send payload bytes to the peer over the best available transport
    pub async fn write(self: &Arc<Self>, data: &[u8]) {
        if self.is_closed() {
            return;
        }

        match self.best_addr() {
            Some(addr) => {
                if let Err(err) = self.mux.write_to(data, addr).await {
                    debug!(peer = self.peer_id, %addr, error = %err, "direct send failed");
                }
            }
            None => {
                debug!(peer = self.peer_id, "sending via relay");
                self.write_to_relay(data);
            }
        }
    }

    /// Pick the current best direct address, kicking probing as needed
    fn best_addr(self: &Arc<Self>) -> Option<SocketAddr> {
        let mut state = self.lock_state();

        if state.send_addr.is_none() {
            self.ping_all_locked(&mut state);
            return None;
        }

        let recheck_due = state
            .recheck_best
            .map_or(true, |at| at.elapsed() > RECHECK_BEST);
        if recheck_due {
            // probing may evict the selected endpoint and invalidate it
            self.ping_all_locked(&mut state);
        }

        state.send_addr
    }

    /// Ping every due endpoint, evicting stale ones; triggers an endpoint
    /// exchange instead when the candidate set is empty or has gone cold
    fn ping_all_locked(self: &Arc<Self>, state: &mut ConnState) {
        let exchange_due = state
            .last_exchange
            .map_or(true, |at| at.elapsed() > EXCHANGE_PERIOD);
        if state.endpoints.is_empty() || exchange_due {
            state.last_exchange = Some(Instant::now());
            self.spawn_exchange();
            return;
        }

        let node_id = self.mux.node_id();
        let now = Instant::now();
        let ConnState {
            pings,
            endpoints,
            send_addr,
            ..
        } = state;

        let mut stale: Vec<SocketAddr> = Vec::new();
        for ep in endpoints.values_mut() {
            // staleness is independent of ping spacing: a candidate past
            // the grace period with no recent pong goes regardless of when
            // it was last pinged
            if ep.active_since.elapsed() > ACTIVE_GRACE {
                let silent = ep.last_pong.map_or(true, |at| at.elapsed() > PONG_SILENCE);
                if silent {
                    stale.push(ep.addr);
                    continue;
                }
            }

            if ep
                .last_ping
                .is_some_and(|at| at.elapsed() <= ENDPOINT_PING_INTERVAL)
            {
                continue;
            }

            let ping = Probe::new(node_id, ProbeType::Ping);
            let buf = match ping.encode() {
                Ok(buf) => buf,
                Err(err) => {
                    warn!(error = %err, "error encoding ping probe");
                    continue;
                }
            };

            if let Err(err) = self.mux.try_write_to(&buf, ep.addr) {
                debug!(addr = %ep.addr, error = %err, "ping send failed");
                continue;
            }
            pings.insert(ping.tx_id, SentPing {
                sent_at: now,
                addr: ep.addr,
            });
            ep.last_ping = Some(now);
            debug!(peer = self.peer_id, tx_id = ping.tx_id, addr = %ep.addr, "sent ping");
        }

        for addr in stale {
            endpoints.remove(&addr);
            debug!(peer = self.peer_id, %addr, "evicted stale endpoint");
            if *send_addr == Some(addr) {
                *send_addr = None;
            }
        }
    }

    /// Handle a pong for one of our outstanding pings
    pub(crate) fn handle_pong(self: &Arc<Self>, probe: &Probe, src: SocketAddr) {
        if self.is_closed() {
            return;
        }

        let mut state = self.lock_state();

        let Some(sent) = state.pings.remove(&probe.tx_id) else {
            debug!(
                peer = self.peer_id,
                tx_id = probe.tx_id,
                %src,
                "pong for a ping we did not send"
            );
            return;
        };

        let rtt = sent.sent_at.elapsed();
        if src != sent.addr {
            // NAT rewrote the source; proceed against whatever entry matches
            debug!(peer = self.peer_id, pinged = %sent.addr, ponged = %src, "pong source differs from pinged address");
        }

        let Some(endpoint) = state.endpoints.get_mut(&src) else {
            debug!(peer = self.peer_id, %src, "pong from unknown endpoint");
            return;
        };
        endpoint.last_pong = Some(Instant::now());
        endpoint.rtt = rtt;
        debug!(peer = self.peer_id, %src, rtt_ms = rtt.as_millis() as u64, "got pong");

        if state.send_addr == Some(src) {
            return;
        }

        let better = match state.send_addr {
            None => true,
            Some(current) => {
                if !is_private(current) && is_private(src) {
                    true
                } else {
                    state
                        .endpoints
                        .get(&current)
                        .is_some_and(|cur| cur.rtt > rtt && rtt > Duration::ZERO)
                }
            }
        };

        if better {
            info!(
                peer = self.peer_id,
                old = ?state.send_addr,
                new = %src,
                rtt_ms = rtt.as_millis() as u64,
                "promoting best path"
            );
            state.send_addr = Some(src);
            state.recheck_best = Some(Instant::now() + POST_PROMOTE_RECHECK);
            // documented acquire order: conn state lock, then mux registry
            self.mux.register_conn_addr(src, self);
        }
    }

    /// Record the source of a received ping as a candidate
    pub(crate) fn add_candidate_from_ping(&self, src: SocketAddr) {
        if self.is_closed() {
            return;
        }
        let mut state = self.lock_state();
        add_candidates_locked(&mut state, &[src]);
    }

    /// Kick off an endpoint exchange via the relay
    ///
    /// Nudges STUN first and gives the reflexive address a moment to settle
    /// on a spawned task, then ships our endpoints as an EndpointRequest.
    fn spawn_exchange(self: &Arc<Self>) {
        debug!(peer = self.peer_id, "exchange triggered");
        self.mux.stun();

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(REFLEXIVE_SETTLE).await;
            if conn.is_closed() {
                return;
            }
            let mut probe = Probe::new(conn.mux.node_id(), ProbeType::EndpointRequest);
            probe.endpoints = Some(conn.mux.endpoints());
            match probe.encode() {
                Ok(buf) => conn.write_to_relay(&buf),
                Err(err) => warn!(error = %err, "error encoding endpoint request"),
            }
        });
    }

    /// Peer asked for our endpoints: adopt theirs, reply with ours
    pub(crate) fn handle_endpoint_request(self: &Arc<Self>, endpoints: Vec<SocketAddr>) {
        if self.is_closed() {
            return;
        }
        debug!(peer = self.peer_id, count = endpoints.len(), "got endpoint request");

        self.mux.stun();
        {
            let mut state = self.lock_state();
            add_candidates_locked(&mut state, &endpoints);
            state.last_exchange = Some(Instant::now());
        }

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(REFLEXIVE_SETTLE).await;
            if conn.is_closed() {
                return;
            }
            let mut probe = Probe::new(conn.mux.node_id(), ProbeType::EndpointResponse);
            probe.endpoints = Some(conn.mux.endpoints());
            match probe.encode() {
                Ok(buf) => conn.write_to_relay(&buf),
                Err(err) => warn!(error = %err, "error encoding endpoint response"),
            }
        });
    }

    /// Peer answered our exchange with its endpoints
    pub(crate) fn handle_endpoint_response(&self, endpoints: Vec<SocketAddr>) {
        if self.is_closed() {
            return;
        }
        debug!(peer = self.peer_id, count = endpoints.len(), "got endpoint response");
        let mut state = self.lock_state();
        add_candidates_locked(&mut state, &endpoints);
    }

    /// Peer wants us to ping now
    pub(crate) fn handle_call(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        debug!(peer = self.peer_id, "got call request");
        let mut state = self.lock_state();
        self.ping_all_locked(&mut state);
    }

    /// Ask the peer to start pinging us now (hole-punch accelerator)
    pub fn request_call(&self) {
        if self.is_closed() {
            return;
        }
        debug!(peer = self.peer_id, "requesting call");
        let call = Probe::new(self.mux.node_id(), ProbeType::Call);
        match call.encode() {
            Ok(buf) => self.write_to_relay(&buf),
            Err(err) => warn!(error = %err, "error encoding call request"),
        }
    }

    /// Inbound payload from this peer, handed upstream
    pub(crate) fn receive(&self, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.mux.deliver(self.peer_id, data);
    }

    fn write_to_relay(&self, data: &[u8]) {
        if self.is_closed() {
            return;
        }
        let mut packet = Vec::with_capacity(KEY_LEN + data.len());
        packet.extend_from_slice(&self.public_key.raw());
        packet.extend_from_slice(data);
        if let Err(err) = self.mux.relay_send(packet) {
            debug!(peer = self.peer_id, error = %err, "relay send failed");
        }
    }

    /// Idempotent close: evicts all endpoints and drops pending state
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.lock_state();
        state.endpoints.clear();
        state.pings.clear();
        state.send_addr = None;
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().expect("conn lock poisoned")
    }
}

fn add_candidates_locked(state: &mut ConnState, endpoints: &[SocketAddr]) {
    let now = Instant::now();
    for addr in endpoints {
        if addr.port() == 0 {
            continue;
        }
        state
            .endpoints
            .entry(*addr)
            .and_modify(|ep| ep.active_since = now)
            .or_insert_with(|| Endpoint {
                addr: *addr,
                last_ping: None,
                last_pong: None,
                rtt: Duration::ZERO,
                active_since: now,
            });
    }
}

fn is_private(addr: SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_private(),
        IpAddr::V6(_) => false,
    }
}
