use thiserror::Error;

/// Largest datagram the protocol will emit or accept.
pub const MAX_PACKET_SIZE: usize = 1400;

const COORD_SCALE: f32 = 8.0;
const ANGLE_SCALE: f32 = 256.0 / 360.0;
const ANGLE16_SCALE: f32 = 65536.0 / 360.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MsgError {
    #[error("read of {wanted} bytes with only {left} left")]
    Underflow { wanted: usize, left: usize },
    #[error("read of {wanted} bits with only {left} left")]
    BitUnderflow { wanted: u32, left: usize },
    #[error("string terminator not found before end of buffer")]
    UnterminatedString,
    #[error("variable-length integer exceeds 64 bits")]
    VarintOverlong,
}

/// Cursor-based binary message buffer.
///
/// Writes fail closed: the first write that would exceed `max_size` sets the
/// overflow flag without touching the contents, and every write after that is
/// refused. Reads past the written region return `MsgError` and set the
/// underflow flag; callers treat that as a malformed packet, not a crash.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    data: Vec<u8>,
    max_size: usize,
    read_cursor: usize,
    overflowed: bool,
    underflowed: bool,
    // sub-byte cursors for write_bits/read_bits; 0 means byte-aligned
    write_bit: u8,
    read_bit: u8,
}

impl MessageBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_size),
            max_size,
            read_cursor: 0,
            overflowed: false,
            underflowed: false,
            write_bit: 0,
            read_bit: 0,
        }
    }

    /// Wraps a received datagram for parsing.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            max_size: bytes.len(),
            read_cursor: 0,
            overflowed: false,
            underflowed: false,
            write_bit: 0,
            read_bit: 0,
        }
    }

    /// Resets cursors and flags, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_cursor = 0;
        self.overflowed = false;
        self.underflowed = false;
        self.write_bit = 0;
        self.read_bit = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes still writable before the buffer overflows.
    pub fn space(&self) -> usize {
        self.max_size - self.data.len()
    }

    /// Bytes consumed by reads so far.
    pub fn bytes_read(&self) -> usize {
        self.read_cursor
    }

    /// Bytes left between the read cursor and the write cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_cursor
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn underflowed(&self) -> bool {
        self.underflowed
    }

    // Writes

    /// Reserves `n` bytes, aligning to a byte boundary first. Returns false
    /// and sets the overflow flag if the write would not fit.
    fn ensure(&mut self, n: usize) -> bool {
        if self.overflowed {
            return false;
        }
        if self.data.len() + n > self.max_size {
            self.overflowed = true;
            return false;
        }
        self.write_bit = 0;
        true
    }

    pub fn write_byte(&mut self, v: u8) {
        if self.ensure(1) {
            self.data.push(v);
        }
    }

    pub fn write_short(&mut self, v: i16) {
        if self.ensure(2) {
            self.data.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn write_long(&mut self, v: i32) {
        if self.ensure(4) {
            self.data.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.ensure(bytes.len()) {
            self.data.extend_from_slice(bytes);
        }
    }

    /// 7-bit continuation encoding: the fewest bytes that represent the exact
    /// value.
    pub fn write_varint(&mut self, mut v: u64) {
        let mut encoded = [0u8; 10];
        let mut n = 0;
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            encoded[n] = byte;
            n += 1;
            if v == 0 {
                break;
            }
        }
        self.write_bytes(&encoded[..n]);
    }

    /// Zigzag-mapped signed variant of `write_varint`.
    pub fn write_varint_signed(&mut self, v: i64) {
        self.write_varint(((v << 1) ^ (v >> 63)) as u64);
    }

    /// World coordinate quantized to 1/8 unit, carried as a short. The
    /// precision loss is part of the wire contract.
    pub fn write_coord(&mut self, v: f32) {
        self.write_short((v * COORD_SCALE) as i16);
    }

    /// Angle in degrees packed into one byte (1/256 of a turn).
    pub fn write_angle(&mut self, v: f32) {
        self.write_byte(((v * ANGLE_SCALE) as i32 & 0xff) as u8);
    }

    /// Angle in degrees packed into a short (1/65536 of a turn).
    pub fn write_angle16(&mut self, v: f32) {
        self.write_short(((v * ANGLE16_SCALE) as i32 & 0xffff) as u16 as i16);
    }

    /// NUL-terminated string. The terminator is written atomically with the
    /// body so an overflow leaves nothing behind.
    pub fn write_string(&mut self, s: &str) {
        if self.ensure(s.len() + 1) {
            self.data.extend_from_slice(s.as_bytes());
            self.data.push(0);
        }
    }

    /// Packs the low `bits` bits of `v`, LSB first, sharing bytes with
    /// neighboring bit writes. Byte-oriented writes realign automatically.
    pub fn write_bits(&mut self, v: u32, bits: u32) {
        debug_assert!(bits >= 1 && bits <= 32);
        if self.overflowed {
            return;
        }
        let tail_bits = if self.write_bit == 0 { 0 } else { 8 - self.write_bit as u32 };
        let new_bytes = (bits.saturating_sub(tail_bits) as usize).div_ceil(8);
        if self.data.len() + new_bytes > self.max_size {
            self.overflowed = true;
            return;
        }
        for i in 0..bits {
            if self.write_bit == 0 {
                self.data.push(0);
            }
            if (v >> i) & 1 != 0 {
                let last = self.data.len() - 1;
                self.data[last] |= 1 << self.write_bit;
            }
            self.write_bit = (self.write_bit + 1) % 8;
        }
    }

    /// Pads the bit cursor out to the next byte boundary.
    pub fn align_write(&mut self) {
        self.write_bit = 0;
    }

    // Reads

    fn read_raw(&mut self, n: usize) -> Result<&[u8], MsgError> {
        self.align_read();
        let left = self.remaining();
        if n > left {
            self.underflowed = true;
            return Err(MsgError::Underflow { wanted: n, left });
        }
        let start = self.read_cursor;
        self.read_cursor += n;
        Ok(&self.data[start..start + n])
    }

    pub fn read_byte(&mut self) -> Result<u8, MsgError> {
        Ok(self.read_raw(1)?[0])
    }

    pub fn read_short(&mut self) -> Result<i16, MsgError> {
        let b = self.read_raw(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_long(&mut self) -> Result<i32, MsgError> {
        let b = self.read_raw(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], MsgError> {
        self.read_raw(n)
    }

    /// Consumes and returns everything between the read and write cursors.
    pub fn read_rest(&mut self) -> &[u8] {
        self.align_read();
        let start = self.read_cursor;
        self.read_cursor = self.data.len();
        &self.data[start..]
    }

    pub fn read_varint(&mut self) -> Result<u64, MsgError> {
        let mut v: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            v |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 64 {
                return Err(MsgError::VarintOverlong);
            }
        }
    }

    pub fn read_varint_signed(&mut self) -> Result<i64, MsgError> {
        let v = self.read_varint()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    pub fn read_coord(&mut self) -> Result<f32, MsgError> {
        Ok(self.read_short()? as f32 / COORD_SCALE)
    }

    pub fn read_angle(&mut self) -> Result<f32, MsgError> {
        Ok(self.read_byte()? as f32 / ANGLE_SCALE)
    }

    pub fn read_angle16(&mut self) -> Result<f32, MsgError> {
        Ok((self.read_short()? as u16) as f32 / ANGLE16_SCALE)
    }

    pub fn read_string(&mut self) -> Result<String, MsgError> {
        self.align_read();
        let rest = &self.data[self.read_cursor..];
        match rest.iter().position(|&b| b == 0) {
            Some(i) => {
                let s = String::from_utf8_lossy(&rest[..i]).into_owned();
                self.read_cursor += i + 1;
                Ok(s)
            }
            None => {
                self.underflowed = true;
                Err(MsgError::UnterminatedString)
            }
        }
    }

    pub fn read_bits(&mut self, bits: u32) -> Result<u32, MsgError> {
        debug_assert!(bits >= 1 && bits <= 32);
        // remaining() still counts the partially-consumed byte
        let left = self.remaining() * 8 - self.read_bit as usize;
        if (bits as usize) > left {
            self.underflowed = true;
            return Err(MsgError::BitUnderflow { wanted: bits, left });
        }
        let mut v: u32 = 0;
        for i in 0..bits {
            let byte = self.data[self.read_cursor];
            if (byte >> self.read_bit) & 1 != 0 {
                v |= 1 << i;
            }
            self.read_bit += 1;
            if self.read_bit == 8 {
                self.read_bit = 0;
                self.read_cursor += 1;
            }
        }
        Ok(v)
    }

    /// Skips the rest of a partially-read byte.
    pub fn align_read(&mut self) {
        if self.read_bit != 0 {
            self.read_bit = 0;
            self.read_cursor += 1;
        }
    }
}
