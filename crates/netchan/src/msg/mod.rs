mod buffer;

pub use buffer::{MessageBuffer, MsgError, MAX_PACKET_SIZE};
