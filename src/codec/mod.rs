//! Audio container support for voice-relay.
//!
//! Supported formats:
//! - Ogg Opus: the TTS provider's output format and the STT provider's input
//!   format. Only used at the edges; the relay itself moves RTP packets.

pub mod crc;
pub mod ogg;

pub use ogg::{demux_frames, mux_frames, ContainerError, OggWriter};

/// RTP payload type negotiated for Opus
pub const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Frame duration used on every boundary (20ms is standard)
pub const FRAME_DURATION_MS: u64 = 20;

/// Samples per channel in one 20ms frame at 48kHz
pub const SAMPLES_PER_FRAME: u32 = 960;

/// fmtp line advertised for the Opus codec
pub const OPUS_FMTP_LINE: &str = "minptime=10;useinbandfec=1";

/// Audio format parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz (e.g., 48000)
    pub sample_rate: u32,
    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u8,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u8) -> Self {
        Self { sample_rate, channels }
    }

    /// Standard format: 48kHz stereo (required for WebRTC)
    pub fn standard() -> Self {
        Self::new(48000, 2)
    }

    /// Samples per millisecond (per channel)
    pub fn samples_per_ms(&self) -> u32 {
        self.sample_rate / 1000
    }

    /// Samples per channel per frame for given duration
    pub fn samples_per_channel(&self, duration_ms: u64) -> u32 {
        self.samples_per_ms() * duration_ms as u32
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::standard()
    }
}
