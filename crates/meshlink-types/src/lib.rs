//! Shared protocol types for the meshlink overlay.
//!
//! Everything both sides of the wire agree on lives here:
//! - Curve25519 node identity keys with a base64 text form
//! - Probe control frames (ping/pong/endpoint exchange/call)
//! - A minimal RFC 5389 STUN binding codec
//! - Control-plane HTTP message bodies

pub mod api;
pub mod error;
pub mod keys;
pub mod probe;
pub mod stun;

pub use error::{TypesError, TypesResult};
pub use keys::{PrivateKey, PublicKey, KEY_LEN};
pub use probe::{Probe, ProbeType};
