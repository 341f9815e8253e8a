mod loopback;
mod simulator;
mod udp;

pub use loopback::LoopbackTransport;
pub use simulator::SimulatedTransport;
pub use udp::UdpTransport;

use std::io;
use std::net::SocketAddr;

/// Datagram carrier underneath a channel. Implementations are unreliable
/// and unordered by contract; the channel assumes nothing more than
/// best-effort delivery of whole datagrams.
pub trait Transport {
    fn send(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Non-blocking: returns `Ok(None)` when nothing is waiting.
    fn recv(&mut self) -> io::Result<Option<(Vec<u8>, SocketAddr)>>;

    fn local_addr(&self) -> SocketAddr;
}
