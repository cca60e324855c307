//! WHIP audio relay server
//!
//! Peers POST their SDP offer to `/whip?room=<id>`. The first two peers in a
//! room are paired and their audio is relayed between them.
//!
//! Usage: relay-server [--bind 0.0.0.0:8080] [--stun-urls stun:host:port,...]

use std::net::SocketAddr;

use clap::Parser;
use voice_relay::{parse_stun_urls, RelayConfig, RelayServer, WhipConfig};

#[derive(Parser, Debug)]
#[command(name = "relay-server", about = "Two-party WebRTC audio relay over WHIP")]
struct Args {
    /// Listen address for the WHIP endpoint
    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Comma-separated STUN URLs (Google STUN when empty)
    #[arg(long, env = "STUN_URLS", default_value = "")]
    stun_urls: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = RelayConfig {
        whip: WhipConfig {
            bind_addr: args.bind,
            ..Default::default()
        },
        ice_servers: parse_stun_urls(&args.stun_urls),
    };

    let mut server = RelayServer::new(config);
    let addr = server.start().await?;
    log::info!("Relay ready: POST SDP offers to http://{}/whip?room=<id>", addr);
    log::info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    log::info!("Stopping...");
    server.stop();

    Ok(())
}
