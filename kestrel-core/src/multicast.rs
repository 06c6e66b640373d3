//! Multicast socket setup for the status/command plane.
//!
//! One group carries both directions: responses lead with a 0 byte,
//! commands with 1, and endpoints skip their own responses. Receive
//! sockets share the port (several processes may watch the same group);
//! send sockets are connected with loopback enabled so a daemon sees the
//! commands it issues to itself during tests.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

pub const DEFAULT_STATUS_PORT: u16 = 5006;

/// Resolve a "group", "group:port" or "host:port" spec.
pub fn resolve(spec: &str, default_port: u16) -> io::Result<SocketAddr> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let resolved = spec
        .to_socket_addrs()
        .or_else(|_| (spec, default_port).to_socket_addrs())?
        .next();
    resolved.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("cannot resolve {spec:?}"),
        )
    })
}

/// Receive socket bound to the group's port, joined to the group on the
/// default interface, address reuse on.
pub fn listen(group: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if group.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    let bind = SocketAddr::new(
        if group.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        },
        group.port(),
    );
    sock.bind(&bind.into())?;
    let sock: UdpSocket = sock.into();
    match group.ip() {
        IpAddr::V4(ip) if ip.is_multicast() => {
            sock.join_multicast_v4(&ip, &Ipv4Addr::UNSPECIFIED)?;
            sock.set_multicast_loop_v4(true)?;
            log::debug!("joined multicast group {}", group);
        }
        IpAddr::V6(ip) if ip.is_multicast() => {
            sock.join_multicast_v6(&ip, 0)?;
            sock.set_multicast_loop_v6(true)?;
            log::debug!("joined multicast group {}", group);
        }
        _ => {} // plain unicast listen, used in tests
    }
    Ok(sock)
}

/// Connected send socket for status traffic toward the group.
pub fn connect(group: SocketAddr, ttl: u32) -> io::Result<UdpSocket> {
    let bind: SocketAddr = if group.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let sock = UdpSocket::bind(bind)?;
    if group.is_ipv4() {
        sock.set_multicast_ttl_v4(ttl)?;
        sock.set_multicast_loop_v4(true)?;
    }
    sock.connect(group)?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_forms() {
        assert_eq!(
            resolve("239.251.8.1:5010", DEFAULT_STATUS_PORT).unwrap(),
            "239.251.8.1:5010".parse().unwrap()
        );
        assert_eq!(
            resolve("239.251.8.1", DEFAULT_STATUS_PORT).unwrap(),
            "239.251.8.1:5006".parse().unwrap()
        );
        assert!(resolve("127.0.0.1:0", DEFAULT_STATUS_PORT).is_ok());
        assert!(resolve("no.such.host.invalid!", DEFAULT_STATUS_PORT).is_err());
    }

    #[test]
    fn test_unicast_listen_and_connect_pair() {
        // The helpers also serve plain unicast, which keeps this test
        // independent of multicast routing on the build host
        let rx = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = rx.local_addr().unwrap();
        let dest = SocketAddr::new("127.0.0.1".parse().unwrap(), addr.port());
        let tx = connect(dest, 1).unwrap();
        tx.send(&[0u8, 1, 2]).unwrap();
        rx.set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 16];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0, 1, 2]);
    }
}
