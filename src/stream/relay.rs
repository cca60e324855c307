//! Relay engine: forwards RTP between the two peers of a paired room.
//!
//! Each pair gets two forwarding tasks, one per direction, keyed by
//! `(room id, Direction)`. A task waits for its source peer's inbound track,
//! then copies packets to the destination's outbound track while draining the
//! source receiver's RTCP.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

/// Relay I/O errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("end of stream")]
    EndOfStream,

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("source peer went away before its track arrived")]
    SourceGone,
}

/// True for errors that mean the remote side closed the stream.
pub fn is_end_of_stream(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("eof") || message.contains("closed")
}

/// Inbound side of a peer: RTP packets plus the RTCP of the same receiver.
pub trait PacketSource: Send + Sync + 'static {
    fn is_audio(&self) -> bool;

    fn read_packet(&self) -> impl Future<Output = Result<Packet, RelayError>> + Send;

    /// Read and discard one batch of feedback
    fn drain_feedback(&self) -> impl Future<Output = Result<(), RelayError>> + Send;
}

/// Outbound side of a peer
pub trait PacketSink: Send + Sync + 'static {
    fn write_packet(&self, packet: &Packet) -> impl Future<Output = Result<(), RelayError>> + Send;
}

/// A peer the relay can wire up
pub trait RelayPeer: Send + Sync + 'static {
    type Source: PacketSource;
    type Sink: PacketSink;

    /// Readiness channel; holds the inbound track once it has arrived
    fn inbound(&self) -> watch::Receiver<Option<Arc<Self::Source>>>;

    fn outbound(&self) -> Arc<Self::Sink>;
}

/// Forwarding direction within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    AToB,
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "A->B"),
            Direction::BToA => write!(f, "B->A"),
        }
    }
}

/// Copy of `packet` with a plain header: no extensions, no padding, no CSRCs.
pub fn strip_extensions(packet: &Packet) -> Packet {
    Packet {
        header: Header {
            version: 2,
            marker: packet.header.marker,
            payload_type: packet.header.payload_type,
            sequence_number: packet.header.sequence_number,
            timestamp: packet.header.timestamp,
            ssrc: packet.header.ssrc,
            ..Default::default()
        },
        payload: packet.payload.clone(),
    }
}

/// Copy packets from `source` to `sink` until the source ends.
///
/// Empty payloads are skipped. Returns the number of packets forwarded.
pub async fn forward_packets<S, K>(source: &S, sink: &K) -> Result<u64, RelayError>
where
    S: PacketSource,
    K: PacketSink,
{
    let mut forwarded = 0u64;
    loop {
        let packet = match source.read_packet().await {
            Ok(packet) => packet,
            Err(RelayError::EndOfStream) => return Ok(forwarded),
            Err(e) => return Err(e),
        };

        if packet.payload.is_empty() {
            continue;
        }

        match sink.write_packet(&strip_extensions(&packet)).await {
            Ok(()) => forwarded += 1,
            Err(RelayError::EndOfStream) => return Ok(forwarded),
            Err(e) => return Err(e),
        }
    }
}

/// Wait until a readiness channel holds a value. None when the sender goes
/// away first.
pub async fn wait_ready<T: Clone>(rx: &mut watch::Receiver<Option<T>>) -> Option<T> {
    loop {
        let current = rx.borrow_and_update().clone();
        if current.is_some() {
            return current;
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

/// Discard feedback until the receiver closes, then park.
pub(crate) async fn discard_feedback<S: PacketSource>(source: &S) {
    while source.drain_feedback().await.is_ok() {}
    std::future::pending::<()>().await
}

async fn run_direction<S, K>(
    room_id: String,
    direction: Direction,
    mut inbound: watch::Receiver<Option<Arc<S>>>,
    sink: Arc<K>,
) where
    S: PacketSource,
    K: PacketSink,
{
    let Some(source) = wait_ready(&mut inbound).await else {
        log::warn!("[Relay] {} {}: {}", room_id, direction, RelayError::SourceGone);
        return;
    };

    if !source.is_audio() {
        log::info!("[Relay] {} {}: ignoring non-audio track", room_id, direction);
        return;
    }

    log::info!("[Relay] {} {}: forwarding", room_id, direction);

    tokio::select! {
        result = forward_packets(&*source, &*sink) => match result {
            Ok(count) => log::info!("[Relay] {} {}: stream ended after {} packets", room_id, direction, count),
            Err(e) => log::error!("[Relay] {} {}: {}", room_id, direction, e),
        },
        _ = discard_feedback(&*source) => {}
    }
}

/// Owns every forwarding task, keyed by room and direction
pub struct RelayEngine {
    tasks: Mutex<HashMap<(String, Direction), JoinHandle<()>>>,
}

impl RelayEngine {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start both directions for a freshly paired room, replacing any tasks
    /// the room already had.
    pub fn start_pair<P: RelayPeer>(&self, room_id: &str, a: &Arc<P>, b: &Arc<P>) {
        let a_to_b = tokio::spawn(run_direction(
            room_id.to_string(),
            Direction::AToB,
            a.inbound(),
            b.outbound(),
        ));
        let b_to_a = tokio::spawn(run_direction(
            room_id.to_string(),
            Direction::BToA,
            b.inbound(),
            a.outbound(),
        ));

        let mut tasks = self.tasks.lock();
        for (direction, handle) in [(Direction::AToB, a_to_b), (Direction::BToA, b_to_a)] {
            if let Some(previous) = tasks.insert((room_id.to_string(), direction), handle) {
                previous.abort();
            }
        }
        log::info!("[Relay] Started relay for room '{}'", room_id);
    }

    /// Abort both directions of a room. Returns how many tasks were stopped.
    pub fn cancel_room(&self, room_id: &str) -> usize {
        let mut tasks = self.tasks.lock();
        let mut cancelled = 0;
        for direction in [Direction::AToB, Direction::BToA] {
            if let Some(handle) = tasks.remove(&(room_id.to_string(), direction)) {
                handle.abort();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            log::info!("[Relay] Cancelled relay for room '{}'", room_id);
        }
        cancelled
    }

    /// Tasks that are still running
    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().values().filter(|h| !h.is_finished()).count()
    }

    pub fn has_task(&self, room_id: &str, direction: Direction) -> bool {
        self.tasks
            .lock()
            .get(&(room_id.to_string(), direction))
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RelayEngine {
    fn drop(&mut self) {
        for handle in self.tasks.lock().values() {
            handle.abort();
        }
    }
}
