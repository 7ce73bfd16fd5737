//! Minimal RFC 5389 STUN Binding Codec
//!
//! Just enough STUN for reflexive address discovery: binding requests,
//! binding success responses, and the XOR-MAPPED-ADDRESS attribute.
//! IPv4 only, matching the overlay transport.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::RngCore;

use crate::error::{TypesError, TypesResult};

/// STUN header length
pub const HEADER_LEN: usize = 20;

/// STUN magic cookie (RFC 5389)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

/// A 96-bit STUN transaction id
pub type TransactionId = [u8; 12];

/// Generate a random transaction id
pub fn new_transaction_id() -> TransactionId {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// True iff the buffer plausibly carries a STUN message
pub fn is_message(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN
        && buf[0] & 0xC0 == 0
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

/// Build a binding request with the given transaction id
pub fn binding_request(txn_id: &TransactionId) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    out.extend_from_slice(txn_id);
    out
}

/// Parse a binding request, returning its transaction id
pub fn parse_binding_request(buf: &[u8]) -> TypesResult<TransactionId> {
    if !is_message(buf) {
        return Err(TypesError::Stun("not a stun message"));
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != BINDING_REQUEST {
        return Err(TypesError::Stun("not a binding request"));
    }
    let mut txn_id = [0u8; 12];
    txn_id.copy_from_slice(&buf[8..20]);
    Ok(txn_id)
}

/// Build a binding success response with XOR-MAPPED-ADDRESS set to `addr`
pub fn binding_success(txn_id: &TransactionId, addr: SocketAddr) -> TypesResult<Vec<u8>> {
    let IpAddr::V4(ip) = addr.ip() else {
        return Err(TypesError::Stun("only ipv4 addresses supported"));
    };

    let xor_port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut xor_ip = ip.octets();
    for (b, c) in xor_ip.iter_mut().zip(cookie) {
        *b ^= c;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + 12);
    out.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    // one attribute: 4-byte header + 8-byte IPv4 value
    out.extend_from_slice(&12u16.to_be_bytes());
    out.extend_from_slice(&cookie);
    out.extend_from_slice(txn_id);

    out.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    out.extend_from_slice(&8u16.to_be_bytes());
    out.push(0);
    out.push(FAMILY_IPV4);
    out.extend_from_slice(&xor_port.to_be_bytes());
    out.extend_from_slice(&xor_ip);
    Ok(out)
}

/// Parse a binding success response, returning the XOR-MAPPED-ADDRESS
pub fn parse_binding_success(buf: &[u8]) -> TypesResult<SocketAddr> {
    if !is_message(buf) {
        return Err(TypesError::Stun("not a stun message"));
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != BINDING_SUCCESS {
        return Err(TypesError::Stun("not a binding success"));
    }

    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < HEADER_LEN + msg_len {
        return Err(TypesError::Stun("message truncated"));
    }

    let mut pos = HEADER_LEN;
    while pos + 4 <= HEADER_LEN + msg_len {
        let attr_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let attr_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > buf.len() {
            break;
        }

        if attr_type == ATTR_XOR_MAPPED_ADDRESS && attr_len >= 8 && buf[pos + 1] == FAMILY_IPV4 {
            let port = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]])
                ^ (MAGIC_COOKIE >> 16) as u16;
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let mut ip = [buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]];
            for (b, c) in ip.iter_mut().zip(cookie) {
                *b ^= c;
            }
            return Ok(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
        }

        // next attribute, 4-byte aligned
        pos += (attr_len + 3) & !3;
    }

    Err(TypesError::Stun("no xor-mapped-address attribute"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_request_header() {
        let txn_id = new_transaction_id();
        let request = binding_request(&txn_id);

        assert_eq!(request.len(), HEADER_LEN);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[4..8], &MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&request[8..20], &txn_id);
        assert!(is_message(&request));
        assert_eq!(parse_binding_request(&request).unwrap(), txn_id);
    }

    #[test]
    fn test_binding_success_round_trip() {
        let txn_id = new_transaction_id();
        let addr: SocketAddr = "203.0.113.7:54321".parse().unwrap();

        let response = binding_success(&txn_id, addr).unwrap();
        assert!(is_message(&response));
        assert_eq!(parse_binding_success(&response).unwrap(), addr);
    }

    #[test]
    fn test_is_message_rejects_garbage() {
        assert!(!is_message(b"short"));
        assert!(!is_message(&[0u8; 20]));
        let mut buf = [0u8; 20];
        buf[0] = 0xFF; // first two bits must be zero
        buf[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        assert!(!is_message(&buf));
    }

    #[test]
    fn test_parse_success_rejects_request() {
        let request = binding_request(&new_transaction_id());
        assert!(parse_binding_success(&request).is_err());
    }

    #[test]
    fn test_parse_request_rejects_success() {
        let response =
            binding_success(&new_transaction_id(), "1.2.3.4:5".parse().unwrap()).unwrap();
        assert!(parse_binding_request(&response).is_err());
    }
}
