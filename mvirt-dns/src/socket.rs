//! Plain UDP socket generations.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Address family a socket serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Ipv4,
    Ipv6,
    /// Unspecified IPv6 address: dual-stack.
    Any,
}

impl SocketKind {
    pub fn for_addr(addr: &SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(_) => SocketKind::Ipv4,
            IpAddr::V6(ip) if ip.is_unspecified() => SocketKind::Any,
            IpAddr::V6(_) => SocketKind::Ipv6,
        }
    }
}

/// One bound, non-blocking UDP socket. Dropping it closes the descriptor.
#[derive(Debug)]
pub struct SocketItem {
    socket: UdpSocket,
    kind: SocketKind,
    /// The address as written in the configuration (port may be 0).
    configured: SocketAddr,
    local: SocketAddr,
}

impl SocketItem {
    /// Bind a non-blocking UDP socket to `addr`.
    ///
    /// IPv6 sockets are v6-only unless bound to the unspecified address,
    /// which always serves both families regardless of `bindv6only`.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let kind = SocketKind::for_addr(&addr);
        let bind = || -> io::Result<(UdpSocket, SocketAddr)> {
            let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
            if addr.is_ipv6() {
                socket.set_only_v6(kind != SocketKind::Any)?;
            }
            socket.set_nonblocking(true)?;
            socket.bind(&addr.into())?;
            let socket: UdpSocket = socket.into();
            let local = socket.local_addr()?;
            Ok((socket, local))
        };
        let (socket, local) = bind().map_err(|source| CoreError::Bind { addr, source })?;
        debug!(%addr, %local, ?kind, "bound socket");
        Ok(Self {
            socket,
            kind,
            configured: addr,
            local,
        })
    }

    /// A second handle on the same descriptor, for carrying a listener over
    /// into the next generation.
    pub fn duplicate(&self) -> Result<Self> {
        let socket = self.socket.try_clone().map_err(|source| CoreError::Bind {
            addr: self.configured,
            source,
        })?;
        Ok(Self {
            socket,
            kind: self.kind,
            configured: self.configured,
            local: self.local,
        })
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn configured_addr(&self) -> SocketAddr {
        self.configured
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// One generation of listening sockets.
pub type SocketSet = Vec<SocketItem>;

/// Build the socket set for `addrs`, all or nothing.
///
/// Addresses already served by `previous` (and not bound to an ephemeral
/// port) reuse its descriptor instead of binding again. On any failure every
/// socket built so far is closed and the error returned.
pub fn build_socket_set(addrs: &[SocketAddr], previous: &[SocketItem]) -> Result<SocketSet> {
    let mut set = Vec::with_capacity(addrs.len());
    let mut carried = 0usize;

    for addr in addrs {
        let existing = previous
            .iter()
            .find(|item| item.configured == *addr && addr.port() != 0);
        let item = match existing {
            Some(item) => {
                carried += 1;
                item.duplicate()?
            }
            None => SocketItem::bind(*addr)?,
        };
        set.push(item);
    }

    info!(
        sockets = set.len(),
        carried,
        bound = set.len() - carried,
        "built socket set"
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::SockRef;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_socket_kind() {
        assert_eq!(SocketKind::for_addr(&loopback(53)), SocketKind::Ipv4);
        assert_eq!(
            SocketKind::for_addr(&SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 53)),
            SocketKind::Ipv6
        );
        assert_eq!(
            SocketKind::for_addr(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 53)),
            SocketKind::Any
        );
    }

    #[test]
    fn test_bind_ephemeral() {
        let set = build_socket_set(&[loopback(0), loopback(0)], &[]).unwrap();
        assert_eq!(set.len(), 2);
        assert_ne!(set[0].local_addr().port(), 0);
        assert_ne!(set[0].local_addr(), set[1].local_addr());
    }

    #[test]
    fn test_carry_over_avoids_rebind() {
        // Find a free port, then listen on it explicitly.
        let fixed = SocketItem::bind(loopback(0)).unwrap().local_addr();
        let previous = build_socket_set(&[fixed], &[]).unwrap();

        // Binding the same address again would fail; carrying it over works.
        assert!(SocketItem::bind(fixed).is_err());
        let next = build_socket_set(&[fixed], &previous).unwrap();
        assert_eq!(next[0].local_addr(), fixed);

        drop(previous);
        let mut buf = [0u8; 4];
        assert_eq!(
            next[0].socket().recv_from(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[test]
    fn test_ipv6_only_unless_unspecified() {
        // Hosts without IPv6 cannot run this.
        if UdpSocket::bind((Ipv6Addr::LOCALHOST, 0)).is_err() {
            return;
        }

        let any = SocketItem::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)).unwrap();
        assert_eq!(any.kind(), SocketKind::Any);
        assert!(!SockRef::from(any.socket()).only_v6().unwrap());

        let v6 = SocketItem::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0)).unwrap();
        assert_eq!(v6.kind(), SocketKind::Ipv6);
        assert!(SockRef::from(v6.socket()).only_v6().unwrap());
    }

    #[test]
    fn test_dual_stack_receives_ipv4() {
        if UdpSocket::bind((Ipv6Addr::LOCALHOST, 0)).is_err() {
            return;
        }

        let any = SocketItem::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)).unwrap();
        let client = UdpSocket::bind(loopback(0)).unwrap();
        client.send_to(b"ping", loopback(any.local_addr().port())).unwrap();

        let mut buf = [0u8; 8];
        let mut received = None;
        for _ in 0..500 {
            match any.socket().recv_from(&mut buf) {
                Ok((len, _)) => {
                    received = Some(len);
                    break;
                }
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
        assert_eq!(received, Some(4));
    }

    #[test]
    fn test_failure_is_all_or_nothing() {
        let taken = SocketItem::bind(loopback(0)).unwrap();
        let err = build_socket_set(&[loopback(0), taken.local_addr()], &[]).unwrap_err();
        assert!(matches!(err, CoreError::Bind { addr, .. } if addr == taken.local_addr()));
    }
}
