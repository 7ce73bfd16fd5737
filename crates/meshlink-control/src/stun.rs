//! STUN Binding Responder
//!
//! Answers binding requests with the datagram's source address in
//! XOR-MAPPED-ADDRESS form. Everything that is not a binding request is
//! dropped silently.

use std::net::SocketAddr;

use meshlink_types::stun;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::ControlResult;

const READ_BUF: usize = 1500;

/// Minimal STUN server for reflexive address discovery
pub struct StunServer {
    socket: UdpSocket,
}

impl StunServer {
    /// Bind the responder socket
    pub async fn bind(addr: SocketAddr) -> ControlResult<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "stun server listening");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> ControlResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until the socket fails; cancel by dropping the future
    pub async fn run(&self) -> ControlResult<()> {
        let mut buf = [0u8; READ_BUF];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(read) => read,
                Err(err) => {
                    warn!(error = %err, "stun socket read failed, shutting down");
                    return Ok(());
                }
            };

            let txn_id = match stun::parse_binding_request(&buf[..len]) {
                Ok(txn_id) => txn_id,
                Err(_) => continue, // non-STUN or non-request traffic
            };

            match stun::binding_success(&txn_id, from) {
                Ok(reply) => {
                    if let Err(err) = self.socket.send_to(&reply, from).await {
                        debug!(%from, error = %err, "failed to send stun reply");
                    }
                }
                Err(err) => debug!(%from, error = %err, "failed to build stun reply"),
            }
        }
    }
}
