use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use netchan::{
    stats::rand_u64, ChannelConfig, ChannelSide, LinkConditions, NetChannel, SimulatedTransport,
    Transport, UdpTransport, VarintFraming,
};

use crate::proto::{self, Command};

pub struct ConnectConfig {
    pub server_addr: String,
    pub name: String,
    pub tick_rate: u32,
    pub chat_every_secs: u64,
    pub link: LinkConditions,
}

const CONNECT_RETRIES: u32 = 5;

/// Walking, chatting demo client. Runs until interrupted.
pub fn run(config: ConnectConfig) -> Result<()> {
    let server_addr = config
        .server_addr
        .parse()
        .with_context(|| format!("bad server address {}", config.server_addr))?;
    let udp = UdpTransport::bind("0.0.0.0:0").context("binding local socket")?;
    info!("local socket {}", udp.local_addr());
    let mut transport = SimulatedTransport::new(udp, config.link);

    let qport = rand_u64() as u16;
    handshake(&mut transport, server_addr, qport, &config.name)?;
    info!("connected to {server_addr} as {} (qport {qport})", config.name);

    let mut channel = NetChannel::new(
        ChannelSide::Client,
        server_addr,
        qport,
        ChannelConfig::default(),
        Instant::now(),
    );

    let tick = Duration::from_secs(1) / config.tick_rate;
    let chat_interval = Duration::from_secs(config.chat_every_secs);
    let start = Instant::now();
    let mut next_chat = start + chat_interval;
    let mut chat_count = 0u32;

    loop {
        let now = Instant::now();

        if now >= next_chat {
            next_chat += chat_interval;
            chat_count += 1;
            let say = Command::Say {
                name: config.name.clone(),
                text: format!("hello #{chat_count}"),
            };
            let payload = proto::encode_commands(&[say], netchan::MAX_PACKET_SIZE);
            channel.enqueue_reliable(&payload)?;
        }

        // walk a slow circle
        let t = now.duration_since(start).as_secs_f32();
        let moving = Command::Move {
            pos: [t.cos() * 64.0, t.sin() * 64.0, 0.0],
            yaw: (t * 30.0) % 360.0,
        };
        channel.set_unreliable(&proto::encode_commands(&[moving], netchan::MAX_PACKET_SIZE));

        channel.transmit(now, &VarintFraming, &mut transport)?;

        while let Some((data, from)) = transport.recv()? {
            if let Some(line) = proto::oob_line(&data) {
                debug!("out-of-band: {line}");
                continue;
            }
            for delivery in channel.process(&data, from, now, &VarintFraming) {
                match proto::decode_commands(delivery.payload()) {
                    Ok(commands) => {
                        for command in commands {
                            if let Command::Say { name, text } = command {
                                info!("<{name}> {text}");
                            }
                        }
                    }
                    Err(err) => debug!("bad payload from server: {err}"),
                }
            }
        }

        thread::sleep(tick);
    }
}

fn handshake(
    transport: &mut dyn Transport,
    server_addr: std::net::SocketAddr,
    qport: u16,
    name: &str,
) -> Result<()> {
    let request = proto::oob_packet(&format!("connect {qport} {name}"));
    for attempt in 0..CONNECT_RETRIES {
        transport.send(&request, server_addr)?;
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            if let Some((data, from)) = transport.recv()? {
                if from != server_addr {
                    continue;
                }
                match proto::oob_line(&data).as_deref() {
                    Some("accept") => return Ok(()),
                    Some(line) if line.starts_with("deny") => {
                        bail!("server refused connection: {line}")
                    }
                    _ => continue,
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        warn!("no handshake reply, retrying ({}/{CONNECT_RETRIES})", attempt + 1);
    }
    bail!("no response from {server_addr} after {CONNECT_RETRIES} attempts")
}
