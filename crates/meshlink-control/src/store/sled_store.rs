//! Sled-backed node store
//!
//! One `nodes` tree keyed by the big-endian node id, JSON-encoded records.
//! Ids come from the database's monotonic id generator and are never reused.

use std::net::Ipv4Addr;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use meshlink_types::PublicKey;

use super::{Store, StoreError, StoreResult};
use crate::node::Node;

const NODES_TREE: &str = "nodes";

/// Disk-backed store using the sled embedded database
pub struct SledStore {
    db: sled::Db,
    nodes: sled::Tree,
}

impl SledStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        let nodes = db.open_tree(NODES_TREE)?;
        Ok(Self { db, nodes })
    }

    fn decode(value: &[u8]) -> StoreResult<Node> {
        Ok(serde_json::from_slice(value)?)
    }

    fn encode(node: &Node) -> StoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(node)?)
    }
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

#[async_trait]
impl Store for SledStore {
    async fn get_nodes(&self) -> StoreResult<Vec<Node>> {
        let mut nodes = Vec::new();
        for entry in self.nodes.iter() {
            let (_, value) = entry?;
            nodes.push(Self::decode(&value)?);
        }
        Ok(nodes)
    }

    async fn get_peers_of(&self, id: u64) -> StoreResult<Vec<Node>> {
        self.get_by_id(id).await?;
        let mut peers = Vec::new();
        for entry in self.nodes.iter() {
            let (_, value) = entry?;
            let node = Self::decode(&value)?;
            if node.id != id {
                peers.push(node);
            }
        }
        Ok(peers)
    }

    async fn get_by_key(&self, key: &PublicKey) -> StoreResult<Node> {
        for entry in self.nodes.iter() {
            let (_, value) = entry?;
            let node = Self::decode(&value)?;
            if node.public_key == *key {
                return Ok(node);
            }
        }
        Err(StoreError::NotFound)
    }

    async fn get_by_id(&self, id: u64) -> StoreResult<Node> {
        match self.nodes.get(id_key(id))? {
            Some(value) => Self::decode(&value),
            None => Err(StoreError::NotFound),
        }
    }

    async fn create(&self, node: &mut Node) -> StoreResult<()> {
        // generate_id is 0-based; node ids start at 1
        node.id = self.db.generate_id()? + 1;
        node.created_at = Utc::now();
        node.updated_at = node.created_at;
        self.nodes.insert(id_key(node.id), Self::encode(node)?)?;
        Ok(())
    }

    async fn update(&self, node: &mut Node) -> StoreResult<()> {
        node.updated_at = Utc::now();
        self.nodes.insert(id_key(node.id), Self::encode(node)?)?;
        Ok(())
    }

    async fn delete(&self, id: u64) -> StoreResult<()> {
        self.nodes.remove(id_key(id))?;
        Ok(())
    }

    async fn get_allocated_tunnel_ips(&self) -> StoreResult<Vec<Ipv4Addr>> {
        let mut ips = Vec::new();
        for entry in self.nodes.iter() {
            let (_, value) = entry?;
            ips.push(Self::decode(&value)?.tunnel_ip);
        }
        Ok(ips)
    }
}
