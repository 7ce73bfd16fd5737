//! Coordinator
//!
//! Registers nodes, allocates overlay IPs, and fans change notifications out
//! to long-polling subscribers. Each subscribed node holds a coalescing
//! one-permit signal: a burst of notifications is observed as a single wake,
//! and a freshly created subscription is pre-seeded so the first poll
//! returns immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use meshlink_types::api::{LoginRequest, LoginResponse, NodeConfig, PollResponse, RemotePeer};
use meshlink_types::{PrivateKey, PublicKey};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ControlError, ControlResult};
use crate::ipam::Ipam;
use crate::node::Node;
use crate::store::{Store, StoreError};

/// Wall timeout for a long poll before answering 408
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscriptions idle longer than this are evicted
const SUBSCRIPTION_IDLE_LIMIT: Duration = Duration::from_secs(5 * 60);

/// Cleanup cadence for stale subscriptions
const CLEANUP_TICK: Duration = Duration::from_secs(60);

/// Coordination service state
pub struct Coordinator {
    store: Arc<dyn Store>,
    ipam: Ipam,
    public_key: PublicKey,
    provision_key: String,
    poll_timeout: Duration,
    subs: Mutex<HashMap<u64, Subscription>>,
}

struct Subscription {
    signal: Arc<Notify>,
    last_poll: Instant,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        ipam: Ipam,
        private_key: PrivateKey,
        provision_key: String,
    ) -> Self {
        Self {
            store,
            ipam,
            public_key: private_key.public(),
            provision_key,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Override the long-poll timeout (tests shrink this)
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// The coordinator's long-term public key
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Direct store access (admin operations and tests)
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Relay admission predicate: key exists, not expired, not disabled
    pub async fn verify_key(&self, key: &PublicKey) -> bool {
        match self.store.get_by_key(key).await {
            Ok(node) => !node.is_expired() && !node.is_disabled(),
            Err(_) => false,
        }
    }

    /// Admission capability handed to the relay after construction; the
    /// one-way function handle keeps the relay from holding the coordinator
    pub fn key_verifier(self: &Arc<Self>) -> crate::relay::KeyVerifier {
        let coordinator = Arc::clone(self);
        Arc::new(move |key: PublicKey| -> futures_util::future::BoxFuture<'static, bool> {
            let coordinator = Arc::clone(&coordinator);
            Box::pin(async move { coordinator.verify_key(&key).await })
        })
    }

    /// Process a login: provision an unknown key, gate expired ones, refresh
    /// the record otherwise. Notifies all subscribers on success.
    pub async fn login(&self, req: LoginRequest) -> ControlResult<LoginResponse> {
        let node = match self.store.get_by_key(&req.node_key).await {
            Ok(mut node) => {
                if node.is_expired() {
                    return Err(ControlError::Unauthorized("node key is expired"));
                }
                node.last_seen = Utc::now();
                if node.hostname != req.hostname {
                    node.hostname = req.hostname;
                }
                self.store.update(&mut node).await?;
                node
            }
            Err(StoreError::NotFound) => {
                if req.provision_key != self.provision_key {
                    return Err(ControlError::Unauthorized("invalid provision key"));
                }
                self.create_node(req.node_key, req.hostname).await?
            }
            Err(err) => return Err(err.into()),
        };

        info!(id = node.id, key = %node.public_key, "node logged in");
        self.notify_all();

        Ok(LoginResponse {
            auth_url: String::new(),
            node_config: NodeConfig {
                id: node.id,
                prefix: node.prefix,
                tunnel_ip: node.tunnel_ip,
            },
        })
    }

    async fn create_node(&self, key: PublicKey, hostname: String) -> ControlResult<Node> {
        let tunnel_ip = self.ipam.allocate()?;
        let mut node = Node::new(key, hostname, tunnel_ip, self.ipam.prefix());

        if let Err(err) = self.store.create(&mut node).await {
            // roll the allocation back so the address is not leaked
            self.ipam.release(tunnel_ip);
            return Err(err.into());
        }

        info!(id = node.id, ip = %tunnel_ip, "provisioned new node");
        Ok(node)
    }

    /// Node lookup for the poll handler
    pub async fn node_by_key(&self, key: &PublicKey) -> ControlResult<Node> {
        Ok(self.store.get_by_key(key).await?)
    }

    /// The peer set visible to `node`, projected for the wire
    pub async fn poll_snapshot(&self, node: &Node) -> ControlResult<PollResponse> {
        let peers = self.store.get_peers_of(node.id).await?;
        Ok(PollResponse {
            peers: peers
                .into_iter()
                .map(|p| RemotePeer {
                    id: p.id,
                    hostname: p.hostname,
                    public_key: p.public_key,
                    tunnel_ip: p.tunnel_ip,
                })
                .collect(),
        })
    }

    /// Fetch (or create) the poll signal for a node id
    ///
    /// New subscriptions carry one stored permit so the first poll returns
    /// immediately; `last_poll` is refreshed on every use.
    pub fn subscribe(&self, id: u64) -> Arc<Notify> {
        let mut subs = self.subs.lock().expect("subscription lock poisoned");
        let sub = subs.entry(id).or_insert_with(|| {
            let signal = Arc::new(Notify::new());
            signal.notify_one();
            Subscription {
                signal,
                last_poll: Instant::now(),
            }
        });
        sub.last_poll = Instant::now();
        sub.signal.clone()
    }

    /// Wake every subscriber; repeated calls coalesce into one stored permit
    pub fn notify_all(&self) {
        let subs = self.subs.lock().expect("subscription lock poisoned");
        for sub in subs.values() {
            sub.signal.notify_one();
        }
    }

    /// Drop subscriptions idle beyond the limit
    pub fn evict_stale_subscriptions(&self) {
        let mut subs = self.subs.lock().expect("subscription lock poisoned");
        let before = subs.len();
        subs.retain(|id, sub| {
            let keep = sub.last_poll.elapsed() <= SUBSCRIPTION_IDLE_LIMIT;
            if !keep {
                debug!(id, "evicting stale poll subscription");
            }
            keep
        });
        if subs.len() != before {
            info!(evicted = before - subs.len(), "cleaned up poll subscriptions");
        }
    }

    /// Background task periodically evicting stale subscriptions
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_TICK);
            loop {
                ticker.tick().await;
                coordinator.evict_stale_subscriptions();
            }
        })
    }

    /// Count of live subscriptions (test hook)
    pub fn subscription_count(&self) -> usize {
        self.subs.lock().expect("subscription lock poisoned").len()
    }

    /// Remove a node and release its address
    pub async fn remove_node(&self, id: u64) -> ControlResult<()> {
        let node = self.store.get_by_id(id).await?;
        self.store.delete(id).await?;
        self.ipam.release(node.tunnel_ip);
        self.notify_all();
        warn!(id, "node deleted by admin operation");
        Ok(())
    }
}
