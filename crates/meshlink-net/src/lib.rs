//! Meshlink Node Transport
//!
//! One UDP socket multiplexed across per-peer sessions:
//! - `Mux` owns the socket, the STUN timer, and the relay attachment
//! - `Conn` tracks candidate endpoints per peer and picks the best path
//! - `RelayClient` keeps the fallback WebSocket to the relay alive

pub mod conn;
pub mod error;
pub mod mux;
pub mod netutil;
pub mod relay_client;

pub use conn::Conn;
pub use error::{NetError, NetResult};
pub use mux::{InboundPacket, Mux, MuxStats};
pub use relay_client::RelayClient;
