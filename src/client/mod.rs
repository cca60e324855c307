//! Client service: drives speech through the relay.
//!
//! - speak: phrases -> TTS -> Opus frames -> paced RTP into a room
//! - listen: RTP from a room -> batches -> Ogg Opus -> STT -> text
//! - api: HTTP front door that starts those jobs
//! - provider: OpenAI-compatible TTS/STT calls

pub mod api;
pub mod listen;
pub mod provider;
pub mod speak;

use std::time::Duration;

use thiserror::Error;

use crate::codec::ContainerError;
use crate::ice::{google_stun_servers, IceServerConfig};
use crate::signaling::WhipClientError;
use crate::stream::input::DEFAULT_BATCH_WINDOW;
use crate::stream::RelayError;

pub use api::{ApiConfig, ClientApi, Job};
pub use provider::{ProviderConfig, SpeechProvider};

/// Phrase sent after every speak job
pub const DEFAULT_CLOSING_PHRASE: &str = "Isso é tudo pessoal";

/// Client job errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },

    #[error("invalid provider response: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Whip(#[from] WhipClientError),

    #[error("bad audio from provider: {0}")]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Client service configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server address (host:port)
    pub relay_server: String,
    /// ICE servers for the WHIP sessions
    pub ice_servers: Vec<IceServerConfig>,
    /// Listen: batch window before a transcription
    pub batch_window: Duration,
    /// Speak: delay after connecting before the first phrase
    pub settle_delay: Duration,
    /// Speak: gap between phrases
    pub phrase_gap: Duration,
    /// Speak: delay before the closing phrase
    pub closing_delay: Duration,
    /// Speak: time to stay connected after the closing phrase
    pub linger: Duration,
    pub closing_phrase: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_server: "127.0.0.1:8080".to_string(),
            ice_servers: google_stun_servers(),
            batch_window: DEFAULT_BATCH_WINDOW,
            settle_delay: Duration::from_secs(2),
            phrase_gap: Duration::from_secs(15),
            closing_delay: Duration::from_secs(2),
            linger: Duration::from_secs(3),
            closing_phrase: DEFAULT_CLOSING_PHRASE.to_string(),
        }
    }
}
