use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use netchan::{
    peek_qport, ChannelConfig, ChannelManager, LinkConditions, SimulatedTransport, Transport,
    UdpTransport, VarintFraming,
};

use crate::proto::{self, Command};

pub struct ServeConfig {
    pub bind_addr: String,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub timeout: Duration,
    pub link: LinkConditions,
}

struct ClientInfo {
    name: String,
    pos: [f32; 3],
    yaw: f32,
}

/// Tiny chat-and-movement server: reliable chat broadcast, unreliable
/// position echo, one channel per client.
pub fn run(config: ServeConfig) -> Result<()> {
    let udp = UdpTransport::bind(&config.bind_addr)
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("listening on {}", udp.local_addr());
    let mut transport = SimulatedTransport::new(udp, config.link);

    let channel_config = ChannelConfig {
        timeout: config.timeout,
        ..ChannelConfig::default()
    };
    let mut manager = ChannelManager::new(config.max_clients, channel_config);
    let mut clients: HashMap<u32, ClientInfo> = HashMap::new();

    let tick = Duration::from_secs(1) / config.tick_rate;
    loop {
        let now = Instant::now();
        let mut chat: Vec<Command> = Vec::new();
        let mut quitters: Vec<u32> = Vec::new();

        while let Some((data, from)) = transport.recv()? {
            if let Some(line) = proto::oob_line(&data) {
                let reply = match handle_connect(&line, &mut manager, from, now) {
                    Ok((id, name)) => {
                        clients.insert(
                            id,
                            ClientInfo {
                                name,
                                pos: [0.0; 3],
                                yaw: 0.0,
                            },
                        );
                        "accept".to_string()
                    }
                    Err(reason) => {
                        warn!("refusing {from}: {reason}");
                        format!("deny {reason}")
                    }
                };
                transport.send(&proto::oob_packet(&reply), from)?;
                continue;
            }

            let Some(id) = manager.lookup(from, peek_qport(&data)) else {
                debug!("packet from unknown peer {from}");
                continue;
            };
            let Some(channel) = manager.get_mut(id) else {
                continue;
            };
            let deliveries = channel.process(&data, from, now, &VarintFraming);
            manager.rebind_addr(id);

            for delivery in deliveries {
                let commands = match proto::decode_commands(delivery.payload()) {
                    Ok(commands) => commands,
                    Err(err) => {
                        debug!("bad payload from {from}: {err}");
                        continue;
                    }
                };
                for command in commands {
                    match command {
                        Command::Say { text, .. } => {
                            if let Some(client) = clients.get(&id) {
                                info!("<{}> {}", client.name, text);
                                chat.push(Command::Say {
                                    name: client.name.clone(),
                                    text,
                                });
                            }
                        }
                        Command::Move { pos, yaw } => {
                            if let Some(client) = clients.get_mut(&id) {
                                client.pos = pos;
                                client.yaw = yaw;
                            }
                        }
                        Command::Quit => quitters.push(id),
                    }
                }
            }
        }

        for id in quitters {
            if let Some(client) = clients.remove(&id) {
                info!("{} quit", client.name);
            }
            manager.remove(id);
        }

        // broadcast chat reliably, positions unreliably
        let positions: Vec<Command> = clients
            .values()
            .map(|c| Command::Move {
                pos: c.pos,
                yaw: c.yaw,
            })
            .collect();
        let chat_payload = if chat.is_empty() {
            None
        } else {
            Some(proto::encode_commands(&chat, netchan::MAX_PACKET_SIZE))
        };
        let position_payload = proto::encode_commands(&positions, netchan::MAX_PACKET_SIZE);

        let mut dead: Vec<u32> = Vec::new();
        for (id, channel) in manager.iter_mut() {
            if let Some(payload) = &chat_payload {
                if let Err(err) = channel.enqueue_reliable(payload) {
                    warn!("dropping client {id}: {err}");
                    dead.push(id);
                    continue;
                }
            }
            if !positions.is_empty() {
                channel.set_unreliable(&position_payload);
            }
            if let Err(err) = channel.transmit(now, &VarintFraming, &mut transport) {
                debug!("transmit to client {id} failed: {err}");
            }
        }
        for id in dead {
            clients.remove(&id);
            manager.remove(id);
        }

        for (id, addr) in manager.cleanup_timed_out(now) {
            if let Some(client) = clients.remove(&id) {
                info!("{} ({addr}) timed out", client.name);
            }
        }

        thread::sleep(tick);
    }
}

fn handle_connect(
    line: &str,
    manager: &mut ChannelManager,
    from: std::net::SocketAddr,
    now: Instant,
) -> Result<(u32, String), String> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some("connect") {
        return Err("unknown command".into());
    }
    let qport: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| "bad qport".to_string())?;
    let name = parts.next().unwrap_or("player").to_string();

    let id = manager
        .create(from, qport, now)
        .map_err(|e| e.to_string())?;
    Ok((id, name))
}
