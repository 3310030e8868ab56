//! Query and frame builders for tests.

use std::net::SocketAddr;

use crate::catalog::RecordType;
use crate::frame::{build_udp_frame, parse_udp};

/// MAC address test clients send from.
pub const CLIENT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// A minimal DNS query for `name`/`qtype` with recursion desired.
pub fn dns_query(id: u16, name: &str, qtype: RecordType) -> Vec<u8> {
    let mut query = Vec::with_capacity(32 + name.len());
    query.extend_from_slice(&id.to_be_bytes());
    query.extend_from_slice(&[0x01, 0x00]);
    query.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.trim_end_matches('.').split('.').filter(|l| !l.is_empty()) {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);
    query.extend_from_slice(&qtype.0.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());
    query
}

/// An Ethernet frame carrying `payload` from a test client to a server.
pub fn query_frame(server_mac: [u8; 6], client: SocketAddr, server: SocketAddr, payload: &[u8]) -> Vec<u8> {
    build_udp_frame(CLIENT_MAC, server_mac, client, server, payload).expect("same address family")
}

/// Source, destination and payload of a reply frame.
pub fn reply_payload(frame: &[u8]) -> Option<(SocketAddr, SocketAddr, Vec<u8>)> {
    let dgram = parse_udp(frame)?;
    Some((dgram.src, dgram.dst, dgram.payload.to_vec()))
}
