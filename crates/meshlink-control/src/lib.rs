//! Meshlink Coordination Service
//!
//! Server-side planes of the overlay:
//! - Coordinator: node provisioning, IP allocation, long-poll update fan-out
//! - Relay: per-key WebSocket registry forwarding opaque frames
//! - STUN: binding responder for reflexive address discovery
//! - IPAM and the persisted node store backing them

pub mod config;
pub mod coordinator;
pub mod error;
pub mod ipam;
pub mod node;
pub mod relay;
pub mod routes;
pub mod server;
pub mod store;
pub mod stun;

pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{ControlError, ControlResult};
pub use ipam::Ipam;
pub use node::Node;
pub use relay::Relay;
pub use store::{MemStore, SledStore, Store, StoreError};
pub use stun::StunServer;
