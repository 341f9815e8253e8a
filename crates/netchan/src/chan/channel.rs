use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use super::header::{
    is_connectionless, sequence_after, PacketHeader, HEADER_BYTES_QPORT, SEQUENCE_MASK,
};
use crate::msg::{MessageBuffer, MAX_PACKET_SIZE};
use crate::stats::ChannelStats;
use crate::transport::Transport;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RELIABLE_BACKLOG: usize = 16 * 1024;

// Room kept below max_packet_size for the header plus framing prefix.
const FRAGMENT_SLACK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSide {
    /// Emits its qport in every sequenced packet.
    Client,
    /// Expects and validates the peer's qport.
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub timeout: Duration,
    pub max_packet_size: usize,
    /// Cap on queued-plus-in-flight reliable bytes; exceeding it is fatal to
    /// the channel.
    pub max_reliable_backlog: usize,
    /// Skip the stale-sequence discard for loopback peers. Only safe on a
    /// lossless in-process link; real localhost UDP can still duplicate
    /// datagrams, so this is opt-in.
    pub trust_loopback: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_packet_size: MAX_PACKET_SIZE,
            max_reliable_backlog: DEFAULT_RELIABLE_BACKLOG,
            trust_loopback: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("reliable backlog full: {queued} bytes queued, cap {cap}")]
    ReliableOverflow { queued: usize, cap: usize },
    #[error("reliable payload of {len} bytes exceeds fragment limit {limit}")]
    ReliableTooLarge { len: usize, limit: usize },
    #[error("channel to {addr} timed out")]
    TimedOut { addr: SocketAddr },
    #[error("channel is not live")]
    NotLive,
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

/// A payload handed up to the application by `NetChannel::process`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Reliable(Vec<u8>),
    Unreliable(Vec<u8>),
}

impl Delivery {
    pub fn is_reliable(&self) -> bool {
        matches!(self, Delivery::Reliable(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Delivery::Reliable(bytes) | Delivery::Unreliable(bytes) => bytes,
        }
    }
}

/// The wire carries no length prefix between the reliable fragment and the
/// unreliable tail; the fragment's own schema defines where it ends. The
/// application supplies that knowledge here: `encode` frames an outgoing
/// payload and `decode` must parse a fragment to completion, returning the
/// payload and the total bytes the fragment occupied.
pub trait ReliableFraming {
    fn encode(&self, payload: &[u8], msg: &mut MessageBuffer);
    fn decode<'a>(&self, data: &'a [u8]) -> Option<(&'a [u8], usize)>;
}

/// Inner schema that prefixes each fragment with its varint byte length.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarintFraming;

impl ReliableFraming for VarintFraming {
    fn encode(&self, payload: &[u8], msg: &mut MessageBuffer) {
        msg.write_varint(payload.len() as u64);
        msg.write_bytes(payload);
    }

    fn decode<'a>(&self, data: &'a [u8]) -> Option<(&'a [u8], usize)> {
        let mut len: u64 = 0;
        let mut shift = 0;
        let mut i = 0;
        loop {
            let byte = *data.get(i)?;
            i += 1;
            len |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return None;
            }
        }
        let end = i.checked_add(len as usize)?;
        let payload = data.get(i..end)?;
        Some((payload, end))
    }
}

/// One logical connection to a peer: wraps reliable and unreliable
/// application payloads into sequenced datagrams and turns received
/// datagrams back into the same stream, surviving loss, duplication and
/// reordering.
///
/// At most one reliable fragment is unacknowledged at a time; further
/// reliable payloads queue behind it in order.
pub struct NetChannel {
    side: ChannelSide,
    state: ChannelState,
    remote_addr: SocketAddr,
    qport: u16,
    config: ChannelConfig,

    outgoing_sequence: u32,
    incoming_sequence: u32,
    incoming_acknowledged: u32,

    // reliability toggle bits, one per direction
    reliable_toggle: bool,
    incoming_reliable_toggle: bool,
    peer_acked_toggle: bool,

    awaiting_ack: bool,
    reliable_pending: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    reliable_fragment: Vec<u8>,
    reliable_sent_at: u32,

    unreliable: Vec<u8>,

    last_received: Instant,
    last_sent: Instant,
    stats: ChannelStats,
}

impl NetChannel {
    pub fn new(
        side: ChannelSide,
        remote_addr: SocketAddr,
        qport: u16,
        config: ChannelConfig,
        now: Instant,
    ) -> Self {
        Self {
            side,
            state: ChannelState::Connecting,
            remote_addr,
            qport,
            config,
            outgoing_sequence: 0,
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            reliable_toggle: false,
            incoming_reliable_toggle: false,
            peer_acked_toggle: false,
            awaiting_ack: false,
            reliable_pending: VecDeque::new(),
            pending_bytes: 0,
            reliable_fragment: Vec::new(),
            reliable_sent_at: 0,
            unreliable: Vec::new(),
            last_received: now,
            last_sent: now,
            stats: ChannelStats::default(),
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn qport(&self) -> u16 {
        self.qport
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    pub fn outgoing_sequence(&self) -> u32 {
        self.outgoing_sequence
    }

    pub fn incoming_sequence(&self) -> u32 {
        self.incoming_sequence
    }

    /// True while a reliable fragment is in flight or queued.
    pub fn has_pending_reliable(&self) -> bool {
        self.awaiting_ack || !self.reliable_pending.is_empty()
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    /// Explicit teardown; the channel stops sending and accepting.
    pub fn disconnect(&mut self) {
        if self.state != ChannelState::Disconnected {
            info!("channel to {} disconnected", self.remote_addr);
        }
        self.state = ChannelState::Disconnected;
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.state != ChannelState::Disconnected
            && now.saturating_duration_since(self.last_received) > self.config.timeout
    }

    fn max_fragment(&self) -> usize {
        self.config.max_packet_size - HEADER_BYTES_QPORT - FRAGMENT_SLACK
    }

    /// Queues a payload for in-order, exactly-once delivery. Each payload
    /// becomes its own fragment. Overflowing the backlog is fatal: dropping
    /// reliable data silently would break the delivery guarantee.
    pub fn enqueue_reliable(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        let limit = self.max_fragment();
        if payload.len() > limit {
            return Err(ChannelError::ReliableTooLarge {
                len: payload.len(),
                limit,
            });
        }
        let queued = self.pending_bytes + self.reliable_fragment.len() + payload.len();
        if queued > self.config.max_reliable_backlog {
            warn!(
                "reliable backlog overflow on channel to {} ({queued} bytes), dropping channel",
                self.remote_addr
            );
            self.state = ChannelState::Disconnected;
            return Err(ChannelError::ReliableOverflow {
                queued,
                cap: self.config.max_reliable_backlog,
            });
        }
        self.pending_bytes += payload.len();
        self.reliable_pending.push_back(payload.to_vec());
        Ok(())
    }

    /// Replaces the per-tick unreliable payload. Whatever was set and not yet
    /// transmitted is discarded; unreliable data is this-tick-only.
    pub fn set_unreliable(&mut self, payload: &[u8]) {
        self.unreliable.clear();
        self.unreliable.extend_from_slice(payload);
    }

    /// Composes and sends at most one packet. Call once per network tick.
    ///
    /// Returns the sequence number sent, or a fatal channel error (timeout,
    /// socket failure).
    pub fn transmit(
        &mut self,
        now: Instant,
        framing: &dyn ReliableFraming,
        transport: &mut dyn Transport,
    ) -> Result<u32, ChannelError> {
        match self.state {
            ChannelState::Disconnected => return Err(ChannelError::NotLive),
            ChannelState::TimedOut => {
                return Err(ChannelError::TimedOut {
                    addr: self.remote_addr,
                });
            }
            _ => {}
        }
        if self.is_timed_out(now) {
            self.state = ChannelState::TimedOut;
            warn!("channel to {} timed out", self.remote_addr);
            return Err(ChannelError::TimedOut {
                addr: self.remote_addr,
            });
        }

        let mut send_reliable = false;

        if !self.awaiting_ack {
            // nothing outstanding: promote the next queued payload
            if let Some(payload) = self.reliable_pending.pop_front() {
                self.pending_bytes -= payload.len();
                self.reliable_fragment = payload;
                self.reliable_toggle = !self.reliable_toggle;
                self.awaiting_ack = true;
                send_reliable = true;
            }
        } else if sequence_after(self.incoming_acknowledged, self.reliable_sent_at)
            && self.peer_acked_toggle != self.reliable_toggle
        {
            // the peer acked traffic sent after the fragment without acking
            // the fragment itself: it was lost, resend the same bytes
            send_reliable = true;
            self.stats.reliable_retransmits += 1;
            debug!(
                "retransmitting reliable fragment to {} (sent at {}, peer acked {})",
                self.remote_addr, self.reliable_sent_at, self.incoming_acknowledged
            );
        }

        self.outgoing_sequence = (self.outgoing_sequence + 1) & SEQUENCE_MASK;

        let mut msg = MessageBuffer::new(self.config.max_packet_size);
        PacketHeader {
            sequence: self.outgoing_sequence,
            reliable: send_reliable,
            ack_sequence: self.incoming_sequence,
            ack_reliable_toggle: self.incoming_reliable_toggle,
            qport: match self.side {
                ChannelSide::Client => Some(self.qport),
                ChannelSide::Server => None,
            },
        }
        .write(&mut msg);

        if send_reliable {
            framing.encode(&self.reliable_fragment, &mut msg);
            self.reliable_sent_at = self.outgoing_sequence;
        }

        if !self.unreliable.is_empty() {
            if self.unreliable.len() <= msg.space() {
                msg.write_bytes(&self.unreliable);
            } else {
                // no room left this tick; unreliable data is best-effort
                self.stats.unreliable_dumped += 1;
                debug!(
                    "dumped {} unreliable bytes to {} ({} bytes of space)",
                    self.unreliable.len(),
                    self.remote_addr,
                    msg.space()
                );
            }
            self.unreliable.clear();
        }

        debug_assert!(!msg.overflowed());
        transport.send(msg.as_slice(), self.remote_addr)?;

        self.last_sent = now;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += msg.len() as u64;
        Ok(self.outgoing_sequence)
    }

    /// Runs one received datagram through the channel. Bad packets (spoofed
    /// source, stale sequence, malformed framing) are discarded without
    /// touching channel state; they are counted and logged, never errors.
    ///
    /// Returns the payloads to hand to the application, reliable fragment
    /// first, unreliable tail after.
    pub fn process(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
        framing: &dyn ReliableFraming,
    ) -> Vec<Delivery> {
        if self.state == ChannelState::Disconnected {
            return Vec::new();
        }
        if is_connectionless(data) {
            // out-of-band traffic is the connection protocol's business
            self.stats.packets_rejected += 1;
            return Vec::new();
        }

        let mut msg = MessageBuffer::from_bytes(data);
        let header =
            match PacketHeader::read(&mut msg, matches!(self.side, ChannelSide::Server)) {
                Ok(header) => header,
                Err(err) => {
                    self.stats.packets_malformed += 1;
                    debug!("malformed header from {from}: {err}");
                    return Vec::new();
                }
            };

        // anti-spoofing: the source must be the bound peer, except that a
        // matching qport lets a NAT rewrite the port out from under us
        let mut rebind = None;
        if matches!(self.side, ChannelSide::Server) && header.qport != Some(self.qport) {
            self.stats.packets_rejected += 1;
            debug!(
                "qport mismatch from {from}: got {:?}, want {}",
                header.qport, self.qport
            );
            return Vec::new();
        }
        if from != self.remote_addr {
            let nat_remap = matches!(self.side, ChannelSide::Server)
                && from.ip() == self.remote_addr.ip();
            if nat_remap {
                rebind = Some(from);
            } else {
                self.stats.packets_rejected += 1;
                debug!(
                    "packet from unexpected source {from}, peer is {}",
                    self.remote_addr
                );
                return Vec::new();
            }
        }

        let loopback_peer = self.config.trust_loopback && self.remote_addr.ip().is_loopback();
        if !loopback_peer && !sequence_after(header.sequence, self.incoming_sequence) {
            // stale, duplicate or reordered: the channel discards, it never
            // reorders
            self.stats.packets_stale += 1;
            debug!(
                "stale packet {} (incoming sequence {}) from {from}",
                header.sequence, self.incoming_sequence
            );
            return Vec::new();
        }

        // parse the payload before committing any state, so a malformed
        // fragment discards the whole packet cleanly
        let rest = msg.read_rest();
        let mut deliveries = Vec::new();
        let tail_start = if header.reliable {
            match framing.decode(rest) {
                Some((payload, consumed)) => {
                    deliveries.push(Delivery::Reliable(payload.to_vec()));
                    consumed
                }
                None => {
                    self.stats.packets_malformed += 1;
                    debug!("unparseable reliable fragment from {from}");
                    return Vec::new();
                }
            }
        } else {
            0
        };
        let tail = &rest[tail_start..];
        if !tail.is_empty() {
            deliveries.push(Delivery::Unreliable(tail.to_vec()));
        }

        // commit
        if let Some(addr) = rebind {
            info!("qport {} remapped {} -> {addr}", self.qport, self.remote_addr);
            self.remote_addr = addr;
        }

        let expected = (self.incoming_sequence + 1) & SEQUENCE_MASK;
        let gap = header.sequence.wrapping_sub(expected) & SEQUENCE_MASK;
        if gap > 0 && sequence_after(header.sequence, expected) {
            self.stats.packets_dropped += gap as u64;
            debug!("{gap} packets dropped before {} from {from}", header.sequence);
        }

        self.incoming_acknowledged = header.ack_sequence;
        self.peer_acked_toggle = header.ack_reliable_toggle;
        if self.awaiting_ack
            && !sequence_after(self.reliable_sent_at, header.ack_sequence)
            && header.ack_reliable_toggle == self.reliable_toggle
        {
            // the in-flight fragment has arrived; the next transmit may
            // promote the next queued payload
            self.awaiting_ack = false;
            self.reliable_fragment.clear();
        }

        if header.reliable {
            self.incoming_reliable_toggle = !self.incoming_reliable_toggle;
        }

        self.incoming_sequence = header.sequence;
        self.last_received = now;
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        if self.state == ChannelState::Connecting {
            self.state = ChannelState::Connected;
            info!("channel to {} established", self.remote_addr);
        }

        deliveries
    }
}
