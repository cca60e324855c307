//! Text-to-speech and speech-to-text over an OpenAI-compatible API.
//!
//! TTS returns Ogg Opus; STT takes an Ogg Opus upload.

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::ClientError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Provider endpoint and model selection
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    /// API root, e.g. "https://api.openai.com/v1"
    pub base_url: String,
    pub tts_model: String,
    pub voice: String,
    pub speed: f32,
    pub stt_model: String,
}

impl ProviderConfig {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
            stt_model: "whisper-1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// TTS/STT client
pub struct SpeechProvider {
    client: Client,
    config: ProviderConfig,
}

impl SpeechProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Synthesize `text`; returns an Ogg Opus file.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ClientError> {
        let body = SpeechRequest {
            model: &self.config.tts_model,
            input: text,
            voice: &self.config.voice,
            response_format: "opus",
            speed: self.config.speed,
        };

        let response = self
            .client
            .post(self.config.endpoint("audio/speech"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        let audio = response.bytes().await?.to_vec();
        log::info!("[TTS] {} bytes of audio for {} chars", audio.len(), text.chars().count());
        Ok(audio)
    }

    /// Transcribe an Ogg Opus file.
    pub async fn transcribe(&self, audio: Vec<u8>) -> Result<String, ClientError> {
        let file = Part::bytes(audio).file_name("audio.ogg").mime_str("audio/ogg")?;
        let form = Form::new()
            .part("file", file)
            .text("model", self.config.stt_model.clone());

        let response = self
            .client
            .post(self.config.endpoint("audio/transcriptions"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        let bytes = response.bytes().await?;
        let result: TranscriptionResponse = serde_json::from_slice(&bytes)?;
        Ok(result.text)
    }
}
