//! Node Persistence
//!
//! The coordinator talks to storage through the `Store` trait so the backing
//! engine stays swappable; shipped implementations are the sled-backed
//! `SledStore` and the in-memory `MemStore` used in tests and debug mode.

mod mem;
mod sled_store;

use std::net::Ipv4Addr;

use async_trait::async_trait;
use meshlink_types::PublicKey;
use thiserror::Error;

use crate::node::Node;

pub use mem::MemStore;
pub use sled_store::SledStore;

/// Storage failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup missed
    #[error("node not found")]
    NotFound,

    /// Backend failure
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Record failed to encode or decode
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence contract for node records
///
/// Implementations must be safe under concurrent callers; serializing writes
/// is acceptable.
#[async_trait]
pub trait Store: Send + Sync {
    /// All persisted nodes
    async fn get_nodes(&self) -> StoreResult<Vec<Node>>;

    /// All nodes except `id`; fails with `NotFound` if `id` itself is missing
    async fn get_peers_of(&self, id: u64) -> StoreResult<Vec<Node>>;

    /// Node by public key
    async fn get_by_key(&self, key: &PublicKey) -> StoreResult<Node>;

    /// Node by id
    async fn get_by_id(&self, id: u64) -> StoreResult<Node>;

    /// Persist a new node, assigning `id` and `created_at`
    async fn create(&self, node: &mut Node) -> StoreResult<()>;

    /// Persist changes to an existing node, bumping `updated_at`
    async fn update(&self, node: &mut Node) -> StoreResult<()>;

    /// Remove a node record
    async fn delete(&self, id: u64) -> StoreResult<()>;

    /// Tunnel IPs of all persisted nodes, for IPAM seeding
    async fn get_allocated_tunnel_ips(&self) -> StoreResult<Vec<Ipv4Addr>>;
}
