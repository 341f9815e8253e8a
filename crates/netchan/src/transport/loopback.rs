use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use super::Transport;

type Queue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// In-memory transport pair for tests and local play: datagrams sent on one
/// half come out of the other, instantly and losslessly.
pub struct LoopbackTransport {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    inbox: Queue,
    peer_inbox: Queue,
}

impl LoopbackTransport {
    pub fn pair(addr_a: SocketAddr, addr_b: SocketAddr) -> (Self, Self) {
        let queue_a: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let queue_b: Queue = Arc::new(Mutex::new(VecDeque::new()));
        let a = Self {
            local_addr: addr_a,
            peer_addr: addr_b,
            inbox: Arc::clone(&queue_a),
            peer_inbox: Arc::clone(&queue_b),
        };
        let b = Self {
            local_addr: addr_b,
            peer_addr: addr_a,
            inbox: queue_b,
            peer_inbox: queue_a,
        };
        (a, b)
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, data: &[u8], _addr: SocketAddr) -> io::Result<usize> {
        let mut queue = self
            .peer_inbox
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "peer queue poisoned"))?;
        queue.push_back(data.to_vec());
        Ok(data.len())
    }

    fn recv(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut queue = self
            .inbox
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "queue poisoned"))?;
        Ok(queue.pop_front().map(|data| (data, self.peer_addr)))
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_delivers_in_order() {
        let addr_a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let addr_b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let (mut a, mut b) = LoopbackTransport::pair(addr_a, addr_b);

        a.send(b"one", addr_b).unwrap();
        a.send(b"two", addr_b).unwrap();

        assert_eq!(b.recv().unwrap(), Some((b"one".to_vec(), addr_a)));
        assert_eq!(b.recv().unwrap(), Some((b"two".to_vec(), addr_a)));
        assert_eq!(b.recv().unwrap(), None);
        assert_eq!(a.recv().unwrap(), None);
    }
}
