//! Output stream: Opus frames -> paced RTP packets on an outbound track.
//!
//! One frame per packet. Sequence number and timestamp carry over between
//! batches so a session sees one continuous stream; the marker bit flags the
//! last frame of each batch.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use crate::codec::ogg::stream_serial;
use crate::codec::{FRAME_DURATION_MS, SAMPLES_PER_FRAME};
use crate::stream::relay::{PacketSink, RelayError};

/// Builds RTP packets for one outbound stream
pub struct Packetizer {
    /// SSRC for this stream
    ssrc: u32,
    /// Next sequence number
    sequence: u16,
    /// Next timestamp
    timestamp: u32,
    /// Payload type
    payload_type: u8,
    /// Timestamp increment per frame
    samples_per_packet: u32,
    packets_built: u64,
    /// When the audio of the last paced batch runs out
    clock_end: Option<Instant>,
}

impl Packetizer {
    /// Create a new packetizer with random SSRC
    pub fn new(payload_type: u8) -> Self {
        Self::with_ssrc(stream_serial(), payload_type)
    }

    /// Create a new packetizer with specific SSRC
    pub fn with_ssrc(ssrc: u32, payload_type: u8) -> Self {
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
            payload_type,
            samples_per_packet: SAMPLES_PER_FRAME,
            packets_built: 0,
            clock_end: None,
        }
    }

    /// Wrap one frame, then advance sequence and timestamp
    pub fn packetize(&mut self, frame: Bytes, marker: bool) -> Packet {
        let packet = Packet {
            header: Header {
                version: 2,
                marker,
                payload_type: self.payload_type,
                sequence_number: self.sequence,
                timestamp: self.timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            },
            payload: frame,
        };

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_packet);
        self.packets_built += 1;
        packet
    }

    /// Wrap a whole batch, marker on the last packet only
    pub fn packetize_batch(&mut self, frames: &[Bytes]) -> Vec<Packet> {
        let last = frames.len().saturating_sub(1);
        frames
            .iter()
            .enumerate()
            .map(|(i, frame)| self.packetize(frame.clone(), i == last))
            .collect()
    }

    /// Advance the timestamp over `gap` of silence without sending anything
    pub fn skip_silence(&mut self, gap: Duration) {
        let samples = gap.as_micros() * SAMPLES_PER_FRAME as u128 / (FRAME_DURATION_MS as u128 * 1000);
        self.timestamp = self.timestamp.wrapping_add(samples as u32);
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Timestamp the next packet will carry
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn packets_built(&self) -> u64 {
        self.packets_built
    }
}

/// Standard 20ms frame interval
pub fn frame_interval() -> Duration {
    Duration::from_millis(FRAME_DURATION_MS)
}

/// Write a batch of frames to `sink`, one every `interval`.
///
/// Deadlines are computed from the batch start, so a slow write does not
/// push every later frame back. Time that passed since the previous batch's
/// audio ran out is added to the timestamp first. Returns the number of
/// packets written.
pub async fn send_paced<K: PacketSink>(
    packetizer: &mut Packetizer,
    frames: &[Bytes],
    sink: &K,
    interval: Duration,
) -> Result<usize, RelayError> {
    let start = Instant::now();
    if let Some(end) = packetizer.clock_end {
        packetizer.skip_silence(start.saturating_duration_since(end));
    }
    let packets = packetizer.packetize_batch(frames);
    if !packets.is_empty() {
        packetizer.clock_end = Some(start + interval * packets.len() as u32);
    }

    for (i, packet) in packets.iter().enumerate() {
        tokio::time::sleep_until(start + interval * i as u32).await;
        sink.write_packet(packet).await?;
    }

    Ok(packets.len())
}
