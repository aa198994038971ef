mod config;
mod server;

use anyhow::Result;
use clap::Parser;

use config::ServerConfig;
use server::GameServer;

#[derive(Parser)]
#[command(name = "clash-server")]
#[command(about = "Clash game server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = clash::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 64)]
    max_peers: usize,

    #[arg(long, default_value_t = 16)]
    max_rooms: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig {
        max_peers: args.max_peers,
        max_rooms: args.max_rooms,
    };

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let mut server = GameServer::new(&bind_addr, config)?;
    log::info!("server listening on {}", server.local_addr());

    server.run();
    log::info!("server shutting down");

    Ok(())
}
