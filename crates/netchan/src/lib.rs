//! Reliable-channel layer over raw datagrams.
//!
//! Two pieces: [`MessageBuffer`], a bounded binary codec with game-oriented
//! primitives (varints, fixed-point coordinates, quantized angles, packed
//! bits), and [`NetChannel`], which sequences datagrams and piggybacks a
//! single retransmitted reliable fragment on the regular packet flow. No
//! dedicated ack packets, no threads: the caller polls a [`Transport`] and
//! drives each channel once per tick.

pub mod chan;
pub mod msg;
pub mod stats;
pub mod transport;

pub use chan::{
    is_connectionless, peek_qport, sequence_after, ChannelConfig, ChannelError, ChannelManager,
    ChannelSide, ChannelState, Delivery, ManagerError, NetChannel, PacketHeader, ReliableFraming,
    VarintFraming, CONNECTIONLESS_MARKER, HEADER_BYTES, HEADER_BYTES_QPORT, SEQUENCE_MASK,
};
pub use msg::{MessageBuffer, MsgError, MAX_PACKET_SIZE};
pub use stats::{ChannelStats, LinkConditions};
pub use transport::{LoopbackTransport, SimulatedTransport, Transport, UdpTransport};
