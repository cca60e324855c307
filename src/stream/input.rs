//! Input stream: inbound RTP -> batches of Opus frames -> Ogg container.
//!
//! Frames accumulate until the batch window expires or a marker packet
//! closes the batch. An empty window produces nothing.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use webrtc::rtp::packet::Packet;

use crate::codec::ogg::{mux_frames, stream_serial};
use crate::stream::relay::{discard_feedback, PacketSource, RelayError};

/// Default batch window
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_secs(3);

/// Ordered frames of one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBatch {
    pub frames: Vec<Bytes>,
    /// True when a marker packet closed the batch
    pub ended_by_marker: bool,
}

impl FrameBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Audio duration covered by the batch
    pub fn duration(&self) -> Duration {
        crate::stream::output::frame_interval() * self.frames.len() as u32
    }

    /// Encode the batch as an Ogg Opus file with a fresh serial number
    pub fn into_container(self) -> Vec<u8> {
        mux_frames(&self.frames, stream_serial())
    }
}

/// Accumulates frames between flushes
pub struct FrameBatcher {
    frames: Vec<Bytes>,
    frames_seen: u64,
}

impl FrameBatcher {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            frames_seen: 0,
        }
    }

    /// Add one packet's payload. Returns the batch when the packet's marker
    /// closes it.
    pub fn push(&mut self, packet: &Packet) -> Option<FrameBatch> {
        if !packet.payload.is_empty() {
            self.frames.push(packet.payload.clone());
            self.frames_seen += 1;
        }
        if packet.header.marker {
            self.take(true)
        } else {
            None
        }
    }

    /// Hand over whatever accumulated; None for an empty window
    pub fn flush(&mut self) -> Option<FrameBatch> {
        self.take(false)
    }

    fn take(&mut self, ended_by_marker: bool) -> Option<FrameBatch> {
        if self.frames.is_empty() {
            return None;
        }
        Some(FrameBatch {
            frames: std::mem::take(&mut self.frames),
            ended_by_marker,
        })
    }

    /// Frames waiting for the next flush
    pub fn pending(&self) -> usize {
        self.frames.len()
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }
}

impl Default for FrameBatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Read `source` until it ends, sending a batch every `window` (or on a
/// marker). Feedback of the same receiver is drained meanwhile. Whatever is
/// pending when the stream ends is flushed as a last batch.
pub async fn collect_batches<S: PacketSource>(
    source: &S,
    window: Duration,
    batches: mpsc::Sender<FrameBatch>,
) -> Result<(), RelayError> {
    let mut batcher = FrameBatcher::new();

    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let drain = discard_feedback(source);
    tokio::pin!(drain);

    loop {
        let ready = tokio::select! {
            result = source.read_packet() => match result {
                Ok(packet) => batcher.push(&packet),
                Err(RelayError::EndOfStream) => {
                    if let Some(batch) = batcher.flush() {
                        let _ = batches.send(batch).await;
                    }
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            _ = ticker.tick() => batcher.flush(),
            _ = &mut drain => None,
        };

        if let Some(batch) = ready {
            log::debug!("[Input] Batch of {} frames ready", batch.len());
            if batches.send(batch).await.is_err() {
                return Ok(());
            }
        }
    }
}
