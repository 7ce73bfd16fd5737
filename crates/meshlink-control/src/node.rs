//! Persisted Node Record

use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use ipnet::Ipv4Net;
use meshlink_types::PublicKey;
use serde::{Deserialize, Serialize};

/// How long a freshly provisioned node key stays valid
pub const DEFAULT_KEY_EXPIRY_DAYS: i64 = 120;

/// A member node as persisted by the coordinator
///
/// `id` is assigned by the store, monotonically and never reused.
/// `tunnel_ip` and `public_key` are unique across live records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub public_key: PublicKey,
    pub hostname: String,
    pub tunnel_ip: Ipv4Addr,
    pub prefix: Ipv4Net,
    pub key_expiry: DateTime<Utc>,
    #[serde(default)]
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    /// Build a new record ready for `Store::create`
    pub fn new(public_key: PublicKey, hostname: String, tunnel_ip: Ipv4Addr, prefix: Ipv4Net) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            public_key,
            hostname,
            tunnel_ip,
            prefix,
            key_expiry: now + Duration::days(DEFAULT_KEY_EXPIRY_DAYS),
            disabled: false,
            created_at: now,
            updated_at: now,
            last_seen: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.key_expiry
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_types::PrivateKey;

    #[test]
    fn test_fresh_node_is_not_expired() {
        let node = Node::new(
            PrivateKey::generate().public(),
            "a".into(),
            "100.70.0.2".parse().unwrap(),
            "100.70.0.0/24".parse().unwrap(),
        );
        assert!(!node.is_expired());
        assert!(!node.is_disabled());
    }

    #[test]
    fn test_past_expiry_detected() {
        let mut node = Node::new(
            PrivateKey::generate().public(),
            "a".into(),
            "100.70.0.2".parse().unwrap(),
            "100.70.0.0/24".parse().unwrap(),
        );
        node.key_expiry = Utc::now() - Duration::hours(1);
        assert!(node.is_expired());
    }
}
