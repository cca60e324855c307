//! Speech client for the relay
//!
//! `POST /speak` joins a room and says phrases through TTS; `POST /listen`
//! joins a room and transcribes what arrives through STT.
//!
//! Usage: OPENAI_API_KEY=... voice-client [--relay-server 127.0.0.1:8080]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use voice_relay::client::api::run_jobs;
use voice_relay::client::provider::DEFAULT_BASE_URL;
use voice_relay::{parse_stun_urls, ApiConfig, ClientApi, ClientConfig, ProviderConfig, SpeechProvider};

#[derive(Parser, Debug)]
#[command(name = "voice-client", about = "Speak and listen in relay rooms via TTS/STT")]
struct Args {
    /// Listen address for the client API
    #[arg(long, env = "CLIENT_BIND", default_value = "0.0.0.0:8081")]
    bind: SocketAddr,

    /// Relay server address (host:port)
    #[arg(long, env = "RELAY_SERVER_ADDR", default_value = "127.0.0.1:8080")]
    relay_server: String,

    /// Comma-separated STUN URLs (Google STUN when empty)
    #[arg(long, env = "STUN_URLS", default_value = "")]
    stun_urls: String,

    /// TTS/STT provider API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// TTS/STT provider base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Listen: audio batched per transcription (ms)
    #[arg(long, env = "BATCH_WINDOW_MS", default_value_t = 3000)]
    batch_window_ms: u64,

    /// Speak: pause between phrases (ms)
    #[arg(long, env = "PHRASE_GAP_MS", default_value_t = 15000)]
    phrase_gap_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = Arc::new(ClientConfig {
        relay_server: args.relay_server,
        ice_servers: parse_stun_urls(&args.stun_urls),
        batch_window: Duration::from_millis(args.batch_window_ms),
        phrase_gap: Duration::from_millis(args.phrase_gap_ms),
        ..Default::default()
    });
    let provider = Arc::new(SpeechProvider::new(
        ProviderConfig::new(&args.api_key).with_base_url(&args.base_url),
    ));

    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let mut api = ClientApi::new(ApiConfig { bind_addr: args.bind }, jobs_tx);
    let addr = api.start().await?;
    log::info!("Client ready on http://{} (relay at {})", addr, config.relay_server);
    log::info!("Press Ctrl+C to stop");

    let runner = tokio::spawn(run_jobs(jobs_rx, config, provider));

    tokio::signal::ctrl_c().await?;
    log::info!("Stopping...");
    api.stop();
    runner.abort();

    Ok(())
}
