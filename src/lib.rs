//! voice-relay - two-party WebRTC audio relay with a speech client
//!
//! Relay server:
//! - WHIP signaling, one POST per peer, rooms of two
//! - RTP forwarded between the paired peers in both directions
//! - peers removed and relays cancelled when a session closes or fails
//!
//! Client service:
//! - speak: phrases -> TTS (Ogg Opus) -> paced RTP into a room
//! - listen: RTP from a room -> batched Ogg Opus -> STT -> text
//!
//! Audio is Opus, 48 kHz stereo, 20 ms frames everywhere.

pub mod client;
pub mod codec;
pub mod ice;
pub mod peer;
pub mod server;
pub mod signaling;
pub mod stream;

#[cfg(test)]
mod test_support;

pub use client::{ApiConfig, ClientApi, ClientConfig, ClientError, Job, ProviderConfig, SpeechProvider};
pub use codec::{demux_frames, mux_frames, AudioFormat, ContainerError, OggWriter};
pub use ice::{google_stun_servers, parse_stun_urls, IceServerConfig};
pub use peer::{Negotiator, Peer, PeerError, Registry, Room, SessionState, Supervisor};
pub use server::{RelayConfig, RelayServer};
pub use signaling::{SignalingError, WhipClient, WhipClientError, WhipConfig, WhipEndpoint};
pub use stream::{Direction, FrameBatch, Packetizer, RelayEngine, RelayError};
