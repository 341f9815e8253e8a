use crate::msg::{MessageBuffer, MsgError};

/// Sequence numbers are 31 bits; the top bit of each header word is overloaded.
pub const SEQUENCE_MASK: u32 = 0x7fff_ffff;

const FRAGMENT_BIT: u32 = 1 << 31;

/// A leading word of all ones marks a connectionless (out-of-band) datagram
/// that bypasses channel sequencing, e.g. handshake traffic.
pub const CONNECTIONLESS_MARKER: i32 = -1;

pub const HEADER_BYTES: usize = 8;
pub const HEADER_BYTES_QPORT: usize = 10;

/// Packet header, with the wire's overloaded bits unpacked into named fields.
///
/// Wire layout (little-endian words):
/// ```text
///  bits  0..30  outgoing sequence          bit 31  reliable fragment present
///  bits 32..62  sequence being acked       bit 63  reliable toggle being acked
///  bits 64..79  qport, client->server only
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub reliable: bool,
    pub ack_sequence: u32,
    pub ack_reliable_toggle: bool,
    pub qport: Option<u16>,
}

impl PacketHeader {
    pub fn write(&self, msg: &mut MessageBuffer) {
        let w1 = (self.sequence & SEQUENCE_MASK) | if self.reliable { FRAGMENT_BIT } else { 0 };
        let w2 = (self.ack_sequence & SEQUENCE_MASK)
            | if self.ack_reliable_toggle { FRAGMENT_BIT } else { 0 };
        msg.write_long(w1 as i32);
        msg.write_long(w2 as i32);
        if let Some(qport) = self.qport {
            msg.write_short(qport as i16);
        }
    }

    pub fn read(msg: &mut MessageBuffer, expect_qport: bool) -> Result<Self, MsgError> {
        let w1 = msg.read_long()? as u32;
        let w2 = msg.read_long()? as u32;
        let qport = if expect_qport {
            Some(msg.read_short()? as u16)
        } else {
            None
        };
        Ok(Self {
            sequence: w1 & SEQUENCE_MASK,
            reliable: w1 & FRAGMENT_BIT != 0,
            ack_sequence: w2 & SEQUENCE_MASK,
            ack_reliable_toggle: w2 & FRAGMENT_BIT != 0,
            qport,
        })
    }
}

pub fn is_connectionless(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == [0xff, 0xff, 0xff, 0xff]
}

/// Reads the qport of a sequenced client->server datagram without consuming it.
pub fn peek_qport(data: &[u8]) -> Option<u16> {
    if is_connectionless(data) || data.len() < HEADER_BYTES_QPORT {
        return None;
    }
    Some(u16::from_le_bytes([data[8], data[9]]))
}

/// True when `a` comes after `b` in the 31-bit sequence space.
pub fn sequence_after(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b) & SEQUENCE_MASK;
    diff != 0 && diff < SEQUENCE_MASK / 2
}
