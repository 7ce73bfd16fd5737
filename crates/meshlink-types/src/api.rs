//! Control-Plane HTTP Messages
//!
//! JSON bodies for the coordinator endpoints (`/key`, `/login`, `/poll`).

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::keys::PublicKey;

/// Response to `GET /key`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlKey {
    pub control_key: PublicKey,
}

/// Body of `POST /login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub node_key: PublicKey,
    pub hostname: String,
    pub provision_key: String,
}

/// Per-node overlay configuration returned on login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: u64,
    pub prefix: Ipv4Net,
    pub tunnel_ip: Ipv4Addr,
}

/// Response to `POST /login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub auth_url: String,
    pub node_config: NodeConfig,
}

/// Body of `POST /poll`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub node_key: PublicKey,
}

/// One peer in a poll snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePeer {
    pub id: u64,
    pub hostname: String,
    pub public_key: PublicKey,
    pub tunnel_ip: Ipv4Addr,
}

/// Response to `POST /poll`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub peers: Vec<RemotePeer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;

    #[test]
    fn test_login_response_wire_shape() {
        let response = LoginResponse {
            auth_url: String::new(),
            node_config: NodeConfig {
                id: 1,
                prefix: "100.70.0.0/24".parse().unwrap(),
                tunnel_ip: "100.70.0.2".parse().unwrap(),
            },
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(json["node_config"]["id"], 1);
        assert_eq!(json["node_config"]["prefix"], "100.70.0.0/24");
        assert_eq!(json["node_config"]["tunnel_ip"], "100.70.0.2");
    }

    #[test]
    fn test_poll_response_round_trip() {
        let response = PollResponse {
            peers: vec![RemotePeer {
                id: 2,
                hostname: "b".into(),
                public_key: PrivateKey::generate().public(),
                tunnel_ip: "100.70.0.3".parse().unwrap(),
            }],
        };

        let back: PollResponse =
            serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();
        assert_eq!(back.peers.len(), 1);
        assert_eq!(back.peers[0].id, 2);
        assert_eq!(back.peers[0].public_key, response.peers[0].public_key);
    }

    #[test]
    fn test_empty_poll_response_decodes() {
        let back: PollResponse = serde_json::from_str("{}").unwrap();
        assert!(back.peers.is_empty());
    }
}
