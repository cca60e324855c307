//! In-memory peers for relay and supervisor tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

use crate::peer::{PeerState, SessionPeer};
use crate::stream::relay::{PacketSink, PacketSource, RelayError, RelayPeer};

pub fn packet(sequence_number: u16, timestamp: u32, payload: &[u8]) -> Packet {
    Packet {
        header: Header {
            version: 2,
            payload_type: 111,
            sequence_number,
            timestamp,
            ssrc: 0x1234_5678,
            ..Default::default()
        },
        payload: Bytes::copy_from_slice(payload),
    }
}

pub struct FakeSource {
    audio: bool,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl FakeSource {
    fn with_kind(audio: bool) -> (Self, mpsc::UnboundedSender<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                audio,
                rx: tokio::sync::Mutex::new(rx),
            },
            tx,
        )
    }

    pub fn audio() -> (Self, mpsc::UnboundedSender<Packet>) {
        Self::with_kind(true)
    }

    pub fn video() -> (Self, mpsc::UnboundedSender<Packet>) {
        Self::with_kind(false)
    }
}

impl PacketSource for FakeSource {
    fn is_audio(&self) -> bool {
        self.audio
    }

    async fn read_packet(&self) -> Result<Packet, RelayError> {
        self.rx.lock().await.recv().await.ok_or(RelayError::EndOfStream)
    }

    async fn drain_feedback(&self) -> Result<(), RelayError> {
        std::future::pending().await
    }
}

#[derive(Default)]
pub struct FakeSink {
    packets: Mutex<Vec<Packet>>,
}

impl FakeSink {
    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().clone()
    }

    /// Poll until `count` packets arrived or `timeout` elapsed
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Packet> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.packets.lock().len() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.packets()
    }
}

impl PacketSink for FakeSink {
    async fn write_packet(&self, packet: &Packet) -> Result<(), RelayError> {
        self.packets.lock().push(packet.clone());
        Ok(())
    }
}

pub struct FakePeer {
    room_id: String,
    inbound_tx: watch::Sender<Option<Arc<FakeSource>>>,
    pub sink: Arc<FakeSink>,
    state: Mutex<PeerState>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn new(room_id: &str) -> Arc<Self> {
        let (inbound_tx, _) = watch::channel(None);
        Arc::new(Self {
            room_id: room_id.to_string(),
            inbound_tx,
            sink: Arc::new(FakeSink::default()),
            state: Mutex::new(PeerState::Waiting),
            closed: AtomicBool::new(false),
        })
    }

    pub fn attach(&self, source: FakeSource) {
        self.inbound_tx.send_replace(Some(Arc::new(source)));
    }

    /// Attach an audio track and return the handle that feeds it
    pub fn attach_audio(&self) -> mpsc::UnboundedSender<Packet> {
        let (source, tx) = FakeSource::audio();
        self.attach(source);
        tx
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl RelayPeer for FakePeer {
    type Source = FakeSource;
    type Sink = FakeSink;

    fn inbound(&self) -> watch::Receiver<Option<Arc<FakeSource>>> {
        self.inbound_tx.subscribe()
    }

    fn outbound(&self) -> Arc<FakeSink> {
        self.sink.clone()
    }
}

impl SessionPeer for FakePeer {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn set_state(&self, state: PeerState) {
        *self.state.lock() = state;
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
