mod connect;
mod proto;
mod serve;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use netchan::LinkConditions;

const DEFAULT_PORT: u16 = 27910;

#[derive(Parser)]
#[command(name = "netchan-demo")]
#[command(about = "Chat and movement demo over the reliable channel")]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    #[arg(long, global = true, help = "Enable packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, global = true, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, global = true, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, global = true, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, global = true, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the server
    Serve {
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[arg(short, long, default_value_t = 20)]
        tick_rate: u32,

        #[arg(short, long, default_value_t = 16)]
        max_clients: usize,

        #[arg(long, default_value_t = 30, help = "Client timeout in seconds")]
        timeout: u64,
    },
    /// Connect to a server
    Connect {
        #[arg(short, long, default_value = "127.0.0.1")]
        server: String,

        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[arg(short, long, default_value = "player")]
        name: String,

        #[arg(short, long, default_value_t = 20)]
        tick_rate: u32,

        #[arg(long, default_value_t = 3, help = "Seconds between chat messages")]
        chat_every: u64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let link = LinkConditions {
        enabled: args.simulate_packet_loss,
        loss_percent: args.loss_percent,
        min_latency_ms: args.min_latency,
        max_latency_ms: args.max_latency,
        jitter_ms: args.jitter,
    };

    match args.command {
        Cmd::Serve {
            bind,
            port,
            tick_rate,
            max_clients,
            timeout,
        } => serve::run(serve::ServeConfig {
            bind_addr: format!("{bind}:{port}"),
            tick_rate,
            max_clients,
            timeout: Duration::from_secs(timeout),
            link,
        }),
        Cmd::Connect {
            server,
            port,
            name,
            tick_rate,
            chat_every,
        } => connect::run(connect::ConnectConfig {
            server_addr: format!("{server}:{port}"),
            name,
            tick_rate,
            chat_every_secs: chat_every,
            link,
        }),
    }
}
