/// Per-channel traffic counters. Every discard path has its own counter so
/// a misbehaving link can be diagnosed from logs alone.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Sequence-gap estimate of packets the network ate.
    pub packets_dropped: u64,
    /// Old or duplicate sequences discarded on receive.
    pub packets_stale: u64,
    /// Spoofed source or qport mismatch.
    pub packets_rejected: u64,
    /// Headers or reliable fragments that failed to parse.
    pub packets_malformed: u64,
    pub reliable_retransmits: u64,
    /// Unreliable payloads dumped for lack of packet space.
    pub unreliable_dumped: u64,
}

/// Artificial link impairment applied by `SimulatedTransport`.
#[derive(Debug, Clone, Default)]
pub struct LinkConditions {
    pub enabled: bool,
    /// Drop probability in percent, 0-100.
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl LinkConditions {
    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percent
    }

    pub fn delay_ms(&self) -> u32 {
        if !self.enabled || self.max_latency_ms == 0 {
            return 0;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = if self.jitter_ms > 0 {
            (rand_percent() * self.jitter_ms as f32) as u32
        } else {
            0
        };
        base + (rand_percent() * range as f32) as u32 + jitter
    }
}

pub fn rand_percent() -> f32 {
    rand_u64() as f32 / u64::MAX as f32
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::Instant;

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    hasher.finish()
}
