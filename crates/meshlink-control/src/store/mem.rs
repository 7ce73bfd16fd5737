//! In-memory node store for tests and debug mode

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use meshlink_types::PublicKey;

use super::{Store, StoreError, StoreResult};
use crate::node::Node;

/// HashMap-backed store; ids are assigned from a monotonic counter
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    nodes: HashMap<u64, Node>,
    next_id: u64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_nodes(&self) -> StoreResult<Vec<Node>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.nodes.values().cloned().collect())
    }

    async fn get_peers_of(&self, id: u64) -> StoreResult<Vec<Node>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        if !inner.nodes.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        Ok(inner
            .nodes
            .values()
            .filter(|n| n.id != id)
            .cloned()
            .collect())
    }

    async fn get_by_key(&self, key: &PublicKey) -> StoreResult<Node> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .nodes
            .values()
            .find(|n| n.public_key == *key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_by_id(&self, id: u64) -> StoreResult<Node> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner.nodes.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn create(&self, node: &mut Node) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.next_id += 1;
        node.id = inner.next_id;
        node.created_at = Utc::now();
        node.updated_at = node.created_at;
        inner.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn update(&self, node: &mut Node) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        node.updated_at = Utc::now();
        inner.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn delete(&self, id: u64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.nodes.remove(&id);
        Ok(())
    }

    async fn get_allocated_tunnel_ips(&self) -> StoreResult<Vec<Ipv4Addr>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.nodes.values().map(|n| n.tunnel_ip).collect())
    }
}
