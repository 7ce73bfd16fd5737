//! Local Endpoint Discovery
//!
//! Seeds the mux's listen endpoints when it is bound to an unspecified
//! address. A scratch socket is "connected" toward a public address to learn
//! the primary outbound IPv4 (no traffic is sent); loopback, unspecified,
//! and the tunnel itself never show up this way.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::debug;

const PROBE_TARGET: &str = "8.8.8.8:53";

/// Local IPv4 endpoints for the given bound port
///
/// Returns an empty list when discovery fails; the caller falls back to the
/// socket's own local address.
pub async fn local_endpoints(port: u16) -> Vec<SocketAddr> {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(err) => {
            debug!(error = %err, "could not bind discovery socket");
            return Vec::new();
        }
    };

    if let Err(err) = socket.connect(PROBE_TARGET).await {
        debug!(error = %err, "local endpoint discovery failed");
        return Vec::new();
    }

    match socket.local_addr() {
        Ok(SocketAddr::V4(addr)) if !addr.ip().is_loopback() && !addr.ip().is_unspecified() => {
            vec![SocketAddr::new((*addr.ip()).into(), port)]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discovered_endpoints_use_given_port() {
        for endpoint in local_endpoints(4567).await {
            assert_eq!(endpoint.port(), 4567);
            assert!(endpoint.is_ipv4());
            assert!(!endpoint.ip().is_loopback());
        }
    }
}
