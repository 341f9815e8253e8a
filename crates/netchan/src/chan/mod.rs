mod channel;
mod header;
mod manager;

pub use channel::{
    ChannelConfig, ChannelError, ChannelSide, ChannelState, Delivery, NetChannel, ReliableFraming,
    VarintFraming,
};
pub use header::{
    is_connectionless, peek_qport, sequence_after, PacketHeader, CONNECTIONLESS_MARKER,
    HEADER_BYTES, HEADER_BYTES_QPORT, SEQUENCE_MASK,
};
pub use manager::{ChannelManager, ManagerError};
