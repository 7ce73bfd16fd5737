//! Probe Control Frames
//!
//! Small path-discovery messages exchanged over the data socket and the
//! relay: a 4-byte big-endian magic followed by a JSON payload. Any buffer
//! that does not start with the magic is never interpreted as a probe.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::{TypesError, TypesResult};

/// Magic prefix distinguishing probe frames from data and STUN
pub const MAGIC: u32 = 0xDEAD_BEEF;

/// Probe message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProbeType {
    /// Reachability probe carrying a fresh transaction id
    Ping = 0xA,
    /// Reply echoing the ping's transaction id
    Pong = 0xB,
    /// Endpoint exchange request carrying the sender's candidates
    EndpointRequest = 0xC,
    /// Endpoint exchange reply carrying the responder's candidates
    EndpointResponse = 0xD,
    /// Ask the peer to start pinging now (hole-punch accelerator)
    Call = 0xE,
}

impl From<ProbeType> for u8 {
    fn from(value: ProbeType) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for ProbeType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0xA => Ok(Self::Ping),
            0xB => Ok(Self::Pong),
            0xC => Ok(Self::EndpointRequest),
            0xD => Ok(Self::EndpointResponse),
            0xE => Ok(Self::Call),
            other => Err(format!("unknown probe type 0x{other:X}")),
        }
    }
}

/// A single probe message
///
/// `endpoint` is set on pongs (the address the ping was observed from);
/// `endpoints` carries candidate lists during exchange. Decoding tolerates
/// unknown fields and missing optionals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    #[serde(default)]
    pub node_id: u64,
    #[serde(default)]
    pub tx_id: u64,
    #[serde(rename = "type")]
    pub kind: ProbeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<SocketAddr>>,
}

impl Probe {
    /// Create a probe with a fresh random transaction id
    pub fn new(node_id: u64, kind: ProbeType) -> Self {
        Self {
            node_id,
            tx_id: rand::random(),
            kind,
            endpoint: None,
            endpoints: None,
        }
    }

    /// Encode as `[magic | json]`
    pub fn encode(&self) -> TypesResult<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode from `[magic | json]`; rejects buffers without the magic
    pub fn decode(buf: &[u8]) -> TypesResult<Self> {
        if !is_probe(buf) {
            return Err(TypesError::NotAProbe);
        }
        Ok(serde_json::from_slice(&buf[4..])?)
    }
}

/// True iff the buffer starts with the probe magic
pub fn is_probe(buf: &[u8]) -> bool {
    buf.len() >= 4 && u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_preserves_fields() {
        let mut probe = Probe::new(7, ProbeType::Pong);
        probe.endpoint = Some("192.168.1.10:4500".parse().unwrap());
        probe.endpoints = Some(vec![
            "10.0.0.1:9000".parse().unwrap(),
            "203.0.113.5:9000".parse().unwrap(),
        ]);

        let encoded = probe.encode().unwrap();
        let decoded = Probe::decode(&encoded).unwrap();

        assert_eq!(decoded.node_id, 7);
        assert_eq!(decoded.tx_id, probe.tx_id);
        assert_eq!(decoded.kind, ProbeType::Pong);
        assert_eq!(decoded.endpoint, probe.endpoint);
        assert_eq!(decoded.endpoints, probe.endpoints);
    }

    #[test]
    fn test_magic_rejects_non_probe() {
        assert!(!is_probe(b"xx"));
        assert!(!is_probe(b"not a probe frame"));
        assert!(matches!(
            Probe::decode(b"data packet bytes"),
            Err(TypesError::NotAProbe)
        ));
    }

    #[test]
    fn test_decode_tolerates_unknown_and_missing_fields() {
        let mut buf = MAGIC.to_be_bytes().to_vec();
        buf.extend_from_slice(br#"{"type":10,"node_id":3,"tx_id":42,"extra":"ignored"}"#);
        let probe = Probe::decode(&buf).unwrap();
        assert_eq!(probe.kind, ProbeType::Ping);
        assert_eq!(probe.node_id, 3);
        assert_eq!(probe.tx_id, 42);
        assert!(probe.endpoint.is_none());
        assert!(probe.endpoints.is_none());
    }

    #[test]
    fn test_unknown_probe_type_rejected() {
        let mut buf = MAGIC.to_be_bytes().to_vec();
        buf.extend_from_slice(br#"{"type":99}"#);
        assert!(Probe::decode(&buf).is_err());
    }

    #[test]
    fn test_fresh_tx_ids_differ() {
        let a = Probe::new(1, ProbeType::Ping);
        let b = Probe::new(1, ProbeType::Ping);
        assert_ne!(a.tx_id, b.tx_id);
    }
}
