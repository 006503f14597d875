use std::io;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};

/// Thin non-blocking UDP wrapper: addressed datagrams out, polled datagrams
/// in. Both protocol roles drive this from a single control loop, so no
/// blocking receive exists at all.
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    pub fn bind(addr: SocketAddrV4) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(UdpEndpoint { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        match self.socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "bound to an IPv6 address",
            )),
        }
    }

    pub fn send_to(&self, buf: &[u8], dst: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(buf, SocketAddr::V4(dst))
    }

    /// Poll for one datagram. `Ok(None)` means the queue is empty; callers
    /// sleep/backoff between polls so phase timeouts stay enforceable.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
        match self.socket.recv_from(buf) {
            Ok((len, SocketAddr::V4(from))) => Ok(Some((len, from))),
            Ok((_, SocketAddr::V6(_))) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn empty_queue_polls_as_none() {
        let sock = UdpEndpoint::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let mut buf = [0u8; 16];
        assert!(sock.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn loopback_datagram_delivery() {
        let a = UdpEndpoint::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let b = UdpEndpoint::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        a.send_to(b"ping", b.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 16];
        let mut got = None;
        for _ in 0..100 {
            if let Some((len, from)) = b.try_recv_from(&mut buf).unwrap() {
                got = Some((len, from));
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let (len, from) = got.expect("datagram never arrived");
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
