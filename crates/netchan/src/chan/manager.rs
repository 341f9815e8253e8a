use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use log::{info, warn};
use thiserror::Error;

use super::channel::{ChannelConfig, ChannelSide, NetChannel};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("channel table full ({max} channels)")]
    Full { max: usize },
    #[error("a channel to {addr} already exists")]
    Exists { addr: SocketAddr },
}

/// Server-side channel table: one `NetChannel` per connected client,
/// addressable by socket address and, for NAT port rewrites, by
/// `(ip, qport)`.
pub struct ChannelManager {
    channels: HashMap<u32, NetChannel>,
    by_addr: HashMap<SocketAddr, u32>,
    by_qport: HashMap<(IpAddr, u16), u32>,
    next_id: u32,
    max_channels: usize,
    config: ChannelConfig,
}

impl ChannelManager {
    pub fn new(max_channels: usize, config: ChannelConfig) -> Self {
        Self {
            channels: HashMap::new(),
            by_addr: HashMap::new(),
            by_qport: HashMap::new(),
            next_id: 1,
            max_channels,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Opens a server-side channel for a client that completed the handshake.
    /// An address with a live channel is refused; the old channel must time
    /// out or be removed before the address can reconnect.
    pub fn create(
        &mut self,
        addr: SocketAddr,
        qport: u16,
        now: Instant,
    ) -> Result<u32, ManagerError> {
        if self.by_addr.contains_key(&addr) {
            return Err(ManagerError::Exists { addr });
        }
        if self.channels.len() >= self.max_channels {
            warn!("refusing channel for {addr}: table full");
            return Err(ManagerError::Full {
                max: self.max_channels,
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        let channel = NetChannel::new(ChannelSide::Server, addr, qport, self.config.clone(), now);
        self.channels.insert(id, channel);
        self.by_addr.insert(addr, id);
        self.by_qport.insert((addr.ip(), qport), id);
        info!("channel {id} opened for {addr} (qport {qport})");
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&NetChannel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut NetChannel> {
        self.channels.get_mut(&id)
    }

    /// Resolves an incoming datagram's source to a channel id: exact address
    /// first, then `(ip, qport)` for clients whose NAT rewrote the port.
    pub fn lookup(&self, addr: SocketAddr, qport: Option<u16>) -> Option<u32> {
        if let Some(&id) = self.by_addr.get(&addr) {
            return Some(id);
        }
        let qport = qport?;
        self.by_qport.get(&(addr.ip(), qport)).copied()
    }

    /// Refreshes the address index after a channel remapped its peer address.
    /// Call when a processed packet arrived from a new source port.
    pub fn rebind_addr(&mut self, id: u32) {
        let Some(channel) = self.channels.get(&id) else {
            return;
        };
        let addr = channel.remote_addr();
        if self.by_addr.get(&addr) == Some(&id) {
            return;
        }
        self.by_addr.retain(|_, v| *v != id);
        self.by_addr.insert(addr, id);
    }

    pub fn remove(&mut self, id: u32) -> Option<NetChannel> {
        let channel = self.channels.remove(&id)?;
        self.by_addr.retain(|_, v| *v != id);
        self.by_qport.retain(|_, v| *v != id);
        info!("channel {id} for {} removed", channel.remote_addr());
        Some(channel)
    }

    /// Drops every channel whose peer has gone silent past the timeout.
    /// Returns what was removed so the caller can clean up its own state.
    pub fn cleanup_timed_out(&mut self, now: Instant) -> Vec<(u32, SocketAddr)> {
        let dead: Vec<u32> = self
            .channels
            .iter()
            .filter(|(_, c)| c.is_timed_out(now))
            .map(|(&id, _)| id)
            .collect();
        let mut removed = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(channel) = self.remove(id) {
                removed.push((id, channel.remote_addr()));
            }
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &NetChannel)> {
        self.channels.iter().map(|(&id, c)| (id, c))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut NetChannel)> {
        self.channels.iter_mut().map(|(&id, c)| (id, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_create_and_lookup() {
        let mut manager = ChannelManager::new(4, ChannelConfig::default());
        let now = Instant::now();
        let a = addr("10.0.0.1:5000");
        let id = manager.create(a, 42, now).unwrap();

        assert_eq!(manager.lookup(a, None), Some(id));
        assert_eq!(manager.lookup(addr("10.0.0.2:5000"), None), None);
        // same host, rewritten port, matching qport
        assert_eq!(manager.lookup(addr("10.0.0.1:6000"), Some(42)), Some(id));
        assert_eq!(manager.lookup(addr("10.0.0.1:6000"), Some(99)), None);
    }

    #[test]
    fn test_duplicate_addr_refused() {
        let mut manager = ChannelManager::new(4, ChannelConfig::default());
        let now = Instant::now();
        let a = addr("10.0.0.1:5000");
        manager.create(a, 1, now).unwrap();
        assert!(matches!(
            manager.create(a, 2, now),
            Err(ManagerError::Exists { .. })
        ));

        manager.remove(manager.lookup(a, None).unwrap());
        assert!(manager.create(a, 2, now).is_ok());
    }

    #[test]
    fn test_table_full() {
        let mut manager = ChannelManager::new(2, ChannelConfig::default());
        let now = Instant::now();
        manager.create(addr("10.0.0.1:5000"), 1, now).unwrap();
        manager.create(addr("10.0.0.2:5000"), 2, now).unwrap();
        assert!(matches!(
            manager.create(addr("10.0.0.3:5000"), 3, now),
            Err(ManagerError::Full { .. })
        ));
    }

    #[test]
    fn test_cleanup_timed_out() {
        let config = ChannelConfig {
            timeout: Duration::from_secs(5),
            ..ChannelConfig::default()
        };
        let mut manager = ChannelManager::new(4, config);
        let start = Instant::now();
        let a = addr("10.0.0.1:5000");
        let id = manager.create(a, 1, start).unwrap();

        assert!(manager.cleanup_timed_out(start).is_empty());
        let removed = manager.cleanup_timed_out(start + Duration::from_secs(6));
        assert_eq!(removed, vec![(id, a)]);
        assert!(manager.is_empty());
        assert_eq!(manager.lookup(a, Some(1)), None);
    }

    #[test]
    fn test_rebind_addr_follows_channel_remap() {
        use super::super::channel::VarintFraming;
        use super::super::header::peek_qport;
        use crate::transport::{LoopbackTransport, Transport};

        let mut manager = ChannelManager::new(4, ChannelConfig::default());
        let now = Instant::now();
        let server = addr("10.0.0.2:27910");
        let client = addr("10.0.0.1:27901");
        let id = manager.create(client, 7, now).unwrap();

        let (mut tc, mut ts) = LoopbackTransport::pair(client, server);
        let mut peer =
            NetChannel::new(ChannelSide::Client, server, 7, ChannelConfig::default(), now);
        peer.set_unreliable(b"hi");
        peer.transmit(now, &VarintFraming, &mut tc).unwrap();
        let (data, _) = ts.recv().unwrap().unwrap();

        // the datagram arrives from a rewritten source port
        let moved = addr("10.0.0.1:40000");
        let looked_up = manager.lookup(moved, peek_qport(&data));
        assert_eq!(looked_up, Some(id));
        let channel = manager.get_mut(id).unwrap();
        channel.process(&data, moved, now, &VarintFraming);
        assert_eq!(channel.remote_addr(), moved);

        manager.rebind_addr(id);
        assert_eq!(manager.lookup(moved, None), Some(id));
        assert_eq!(manager.lookup(client, None), None);
    }
}
