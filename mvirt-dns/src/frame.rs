//! Ethernet/IP/UDP framing for raw adapters.
//!
//! Raw adapters deliver whole Ethernet frames. Workers only care about UDP
//! datagrams addressed to a configured interface; everything else is dropped
//! without inspection.

use std::net::{IpAddr, SocketAddr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, IpAddress, IpProtocol,
    Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, UdpPacket, UdpRepr,
};

/// Ethernet header size
const ETHERNET_HEADER_SIZE: usize = 14;

/// Minimum IPv4 header size
const IPV4_HEADER_SIZE: usize = 20;

/// IPv6 fixed header size
const IPV6_HEADER_SIZE: usize = 40;

/// UDP header size
const UDP_HEADER_SIZE: usize = 8;

/// A UDP datagram lifted out of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub payload: &'a [u8],
}

/// Parse an Ethernet frame carrying IPv4 or IPv6 UDP.
pub fn parse_udp(frame: &[u8]) -> Option<UdpDatagram<'_>> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    let src_mac = eth.src_addr().0;
    let dst_mac = eth.dst_addr().0;

    let (src_ip, dst_ip, l4_offset, l4_len) = match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
            if ip.next_header() != IpProtocol::Udp || ip.more_frags() || ip.frag_offset() != 0 {
                return None;
            }
            let header_len = ip.header_len() as usize;
            let l4_len = (ip.total_len() as usize).checked_sub(header_len)?;
            (
                IpAddr::V4(ip.src_addr()),
                IpAddr::V4(ip.dst_addr()),
                ETHERNET_HEADER_SIZE + header_len,
                l4_len,
            )
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(eth.payload()).ok()?;
            if ip.next_header() != IpProtocol::Udp {
                return None;
            }
            (
                IpAddr::V6(ip.src_addr()),
                IpAddr::V6(ip.dst_addr()),
                ETHERNET_HEADER_SIZE + IPV6_HEADER_SIZE,
                ip.payload_len() as usize,
            )
        }
        _ => return None,
    };

    let l4 = frame.get(l4_offset..l4_offset + l4_len)?;
    let udp = UdpPacket::new_checked(l4).ok()?;
    let start = l4_offset + UDP_HEADER_SIZE;
    let end = l4_offset + udp.len() as usize;

    Some(UdpDatagram {
        src_mac,
        dst_mac,
        src: SocketAddr::new(src_ip, udp.src_port()),
        dst: SocketAddr::new(dst_ip, udp.dst_port()),
        payload: frame.get(start..end)?,
    })
}

/// Build an Ethernet frame carrying `payload` from `src` to `dst`.
///
/// Returns `None` when the two addresses are of different families.
pub fn build_udp_frame(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src: SocketAddr,
    dst: SocketAddr,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let udp_len = UDP_HEADER_SIZE + payload.len();
    let checksums = ChecksumCapabilities::default();

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let mut packet = vec![0u8; ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE + udp_len];
            let mut eth = EthernetFrame::new_unchecked(&mut packet[..]);
            EthernetRepr {
                src_addr: EthernetAddress(src_mac),
                dst_addr: EthernetAddress(dst_mac),
                ethertype: EthernetProtocol::Ipv4,
            }
            .emit(&mut eth);

            let ip_repr = Ipv4Repr {
                src_addr: src_ip,
                dst_addr: dst_ip,
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: 64,
            };
            let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
            ip_repr.emit(&mut ip, &checksums);

            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp_repr.emit(
                &mut udp,
                &IpAddress::Ipv4(src_ip),
                &IpAddress::Ipv4(dst_ip),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &checksums,
            );
            Some(packet)
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            let mut packet = vec![0u8; ETHERNET_HEADER_SIZE + IPV6_HEADER_SIZE + udp_len];
            let mut eth = EthernetFrame::new_unchecked(&mut packet[..]);
            EthernetRepr {
                src_addr: EthernetAddress(src_mac),
                dst_addr: EthernetAddress(dst_mac),
                ethertype: EthernetProtocol::Ipv6,
            }
            .emit(&mut eth);

            let ip_repr = Ipv6Repr {
                src_addr: src_ip,
                dst_addr: dst_ip,
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: 64,
            };
            let mut ip = Ipv6Packet::new_unchecked(eth.payload_mut());
            ip_repr.emit(&mut ip);

            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp_repr.emit(
                &mut udp,
                &IpAddress::Ipv6(src_ip),
                &IpAddress::Ipv6(dst_ip),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &checksums,
            );
            Some(packet)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const CLIENT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];
    const SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x53];

    #[test]
    fn test_ipv4_datagram() {
        let client: SocketAddr = (Ipv4Addr::new(10, 0, 0, 7), 40000).into();
        let server: SocketAddr = (Ipv4Addr::new(10, 0, 0, 2), 53).into();
        let frame = build_udp_frame(CLIENT_MAC, SERVER_MAC, client, server, b"query").unwrap();

        let dgram = parse_udp(&frame).unwrap();
        assert_eq!(dgram.src_mac, CLIENT_MAC);
        assert_eq!(dgram.dst_mac, SERVER_MAC);
        assert_eq!(dgram.src, client);
        assert_eq!(dgram.dst, server);
        assert_eq!(dgram.payload, b"query");
    }

    #[test]
    fn test_ipv6_datagram() {
        let client: SocketAddr = (Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 7), 40000).into();
        let server: SocketAddr = (Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2), 53).into();
        let frame = build_udp_frame(CLIENT_MAC, SERVER_MAC, client, server, b"q6").unwrap();

        let dgram = parse_udp(&frame).unwrap();
        assert_eq!(dgram.src, client);
        assert_eq!(dgram.dst, server);
        assert_eq!(dgram.payload, b"q6");
    }

    #[test]
    fn test_mixed_families_rejected() {
        let v4: SocketAddr = (Ipv4Addr::LOCALHOST, 53).into();
        let v6: SocketAddr = (Ipv6Addr::LOCALHOST, 53).into();
        assert!(build_udp_frame(CLIENT_MAC, SERVER_MAC, v4, v6, b"x").is_none());
    }

    #[test]
    fn test_non_udp_ignored() {
        let client: SocketAddr = (Ipv4Addr::new(10, 0, 0, 7), 40000).into();
        let server: SocketAddr = (Ipv4Addr::new(10, 0, 0, 2), 53).into();
        let mut frame = build_udp_frame(CLIENT_MAC, SERVER_MAC, client, server, b"x").unwrap();
        // Rewrite the protocol field to TCP; the header checksum is not verified.
        frame[ETHERNET_HEADER_SIZE + 9] = 6;
        assert!(parse_udp(&frame).is_none());

        assert!(parse_udp(&[0u8; 10]).is_none());
    }
}
