use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::Transport;
use crate::stats::LinkConditions;

#[derive(Debug)]
struct DelayedPacket {
    release_time: Instant,
    data: Vec<u8>,
    addr: SocketAddr,
}

impl PartialEq for DelayedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.release_time == other.release_time
    }
}

impl Eq for DelayedPacket {}

impl PartialOrd for DelayedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other.release_time.cmp(&self.release_time)
    }
}

/// Wraps another transport and impairs it: probabilistic loss plus latency
/// and jitter in both directions. Exercises the retransmission machinery
/// without leaving the process.
pub struct SimulatedTransport<T> {
    inner: T,
    conditions: LinkConditions,
    inbound: BinaryHeap<DelayedPacket>,
    outbound: BinaryHeap<DelayedPacket>,
    dropped: u64,
}

impl<T: Transport> SimulatedTransport<T> {
    pub fn new(inner: T, conditions: LinkConditions) -> Self {
        Self {
            inner,
            conditions,
            inbound: BinaryHeap::new(),
            outbound: BinaryHeap::new(),
            dropped: 0,
        }
    }

    pub fn set_conditions(&mut self, conditions: LinkConditions) {
        self.conditions = conditions;
    }

    /// Packets eaten by the simulated link, both directions.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn pump_outbound(&mut self) -> io::Result<()> {
        let now = Instant::now();
        while let Some(delayed) = self.outbound.peek() {
            if delayed.release_time > now {
                break;
            }
            let Some(delayed) = self.outbound.pop() else {
                break;
            };
            self.inner.send(&delayed.data, delayed.addr)?;
        }
        Ok(())
    }

    fn pump_inbound(&mut self) -> io::Result<()> {
        while let Some((data, addr)) = self.inner.recv()? {
            if self.conditions.should_drop() {
                self.dropped += 1;
                continue;
            }
            let delay = Duration::from_millis(self.conditions.delay_ms() as u64);
            self.inbound.push(DelayedPacket {
                release_time: Instant::now() + delay,
                data,
                addr,
            });
        }
        Ok(())
    }
}

impl<T: Transport> Transport for SimulatedTransport<T> {
    fn send(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.pump_outbound()?;
        if self.conditions.should_drop() {
            // the caller sees a successful send, as with a real lossy link
            self.dropped += 1;
            return Ok(data.len());
        }
        let delay = Duration::from_millis(self.conditions.delay_ms() as u64);
        if delay.is_zero() {
            return self.inner.send(data, addr);
        }
        self.outbound.push(DelayedPacket {
            release_time: Instant::now() + delay,
            data: data.to_vec(),
            addr,
        });
        Ok(data.len())
    }

    fn recv(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        self.pump_outbound()?;
        self.pump_inbound()?;
        let now = Instant::now();
        if let Some(delayed) = self.inbound.peek() {
            if delayed.release_time <= now {
                let delayed = self
                    .inbound
                    .pop()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "heap emptied"))?;
                return Ok(Some((delayed.data, delayed.addr)));
            }
        }
        Ok(None)
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("10.0.0.1:1000".parse().unwrap(), "10.0.0.2:2000".parse().unwrap())
    }

    #[test]
    fn test_clean_link_passes_through() {
        let (addr_a, addr_b) = addrs();
        let (ta, mut tb) = LoopbackTransport::pair(addr_a, addr_b);
        let mut sim = SimulatedTransport::new(ta, LinkConditions::default());

        sim.send(b"hello", addr_b).unwrap();
        assert_eq!(tb.recv().unwrap(), Some((b"hello".to_vec(), addr_a)));
        assert_eq!(sim.dropped(), 0);
    }

    #[test]
    fn test_total_loss_eats_sends() {
        let (addr_a, addr_b) = addrs();
        let (ta, mut tb) = LoopbackTransport::pair(addr_a, addr_b);
        let conditions = LinkConditions {
            enabled: true,
            loss_percent: 100.0,
            ..LinkConditions::default()
        };
        let mut sim = SimulatedTransport::new(ta, conditions);

        for _ in 0..10 {
            sim.send(b"gone", addr_b).unwrap();
        }
        assert_eq!(tb.recv().unwrap(), None);
        assert_eq!(sim.dropped(), 10);
    }

    #[test]
    fn test_latency_holds_packets_back() {
        let (addr_a, addr_b) = addrs();
        let (ta, mut tb) = LoopbackTransport::pair(addr_a, addr_b);
        let conditions = LinkConditions {
            enabled: true,
            min_latency_ms: 30,
            max_latency_ms: 30,
            ..LinkConditions::default()
        };
        let mut sim = SimulatedTransport::new(ta, conditions);

        sim.send(b"later", addr_b).unwrap();
        assert_eq!(tb.recv().unwrap(), None);

        std::thread::sleep(Duration::from_millis(40));
        // the held packet releases on the next transport activity
        sim.recv().unwrap();
        assert_eq!(tb.recv().unwrap(), Some((b"later".to_vec(), addr_a)));
    }
}
