use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use super::Transport;
use crate::msg::MAX_PACKET_SIZE;

/// Non-blocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram exceeds MTU",
            ));
        }
        self.socket.send_to(data, addr)
    }

    fn recv(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        match self.socket.recv_from(&mut self.recv_buffer) {
            Ok((size, addr)) => Ok(Some((self.recv_buffer[..size].to_vec(), addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_round_trip() {
        let mut a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0").unwrap();

        a.send(b"ping", b.local_addr()).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if let Some((data, from)) = b.recv().unwrap() {
                assert_eq!(data, b"ping");
                assert_eq!(from, a.local_addr());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no packet arrived");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn test_recv_without_traffic_is_none() {
        let mut t = UdpTransport::bind("127.0.0.1:0").unwrap();
        assert!(t.recv().unwrap().is_none());
    }

    #[test]
    fn test_oversized_send_refused() {
        let mut t = UdpTransport::bind("127.0.0.1:0").unwrap();
        let data = vec![0u8; MAX_PACKET_SIZE + 1];
        let addr = t.local_addr();
        assert!(t.send(&data, addr).is_err());
    }
}
