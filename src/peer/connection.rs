//! Single WebRTC peer connection on the relay side.
//!
//! Wraps RTCPeerConnection from webrtc-rs: answers one WHIP offer, exposes
//! the outbound track the relay writes to and the inbound track it reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::state::{PeerState, SessionState};
use super::supervisor::{EventSender, SessionEvent, SessionPeer};
use crate::codec::{AudioFormat, OPUS_FMTP_LINE, OPUS_PAYLOAD_TYPE};
use crate::ice::IceServerConfig;
use crate::stream::relay::{is_end_of_stream, PacketSink, PacketSource, RelayError, RelayPeer};

/// RTCP read buffer (one MTU)
const RTCP_BUFFER_SIZE: usize = 1500;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Peer connection errors
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("{context}: {source}")]
    WebRtc {
        context: &'static str,
        #[source]
        source: webrtc::Error,
    },

    #[error("no local description available")]
    NoLocalDescription,
}

fn webrtc_err(context: &'static str) -> impl FnOnce(webrtc::Error) -> PeerError {
    move |source| PeerError::WebRtc { context, source }
}

fn read_error(e: webrtc::Error) -> RelayError {
    let message = e.to_string();
    if is_end_of_stream(&message) {
        RelayError::EndOfStream
    } else {
        RelayError::Read(message)
    }
}

fn write_error(e: webrtc::Error) -> RelayError {
    let message = e.to_string();
    if is_end_of_stream(&message) {
        RelayError::EndOfStream
    } else {
        RelayError::Write(message)
    }
}

/// Opus 48kHz stereo, the only codec either side offers
pub fn opus_capability() -> RTCRtpCodecCapability {
    let format = AudioFormat::standard();
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: format.sample_rate,
        channels: format.channels as u16,
        sdp_fmtp_line: OPUS_FMTP_LINE.to_owned(),
        rtcp_feedback: vec![],
    }
}

/// Build the shared webrtc API: Opus only, default interceptors, UDP only.
pub fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(webrtc_err("Failed to register Opus codec"))?;

    let mut registry = InterceptorRegistry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(webrtc_err("Failed to register interceptors"))?;

    let mut setting_engine = SettingEngine::default();
    setting_engine.set_network_types(vec![NetworkType::Udp4, NetworkType::Udp6]);

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// Build RTCConfiguration from ICE servers
pub fn build_rtc_config(ice_servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers.iter().map(|s| s.to_rtc_ice_server()).collect(),
        ..Default::default()
    }
}

/// Read and discard RTCP for a sender until it closes
pub fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

/// Create a send track for this codec and attach it to the connection
pub async fn attach_outbound_track(
    peer_connection: &RTCPeerConnection,
    stream_id: String,
) -> Result<Arc<TrackLocalStaticRTP>, PeerError> {
    let track = Arc::new(TrackLocalStaticRTP::new(
        opus_capability(),
        "audio".to_owned(),
        stream_id,
    ));

    let sender = peer_connection
        .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .map_err(webrtc_err("Failed to add track"))?;
    spawn_rtcp_drain(sender);

    Ok(track)
}

/// Remote track plus the receiver whose RTCP must be drained alongside it
pub struct InboundTrack {
    track: Arc<TrackRemote>,
    receiver: Arc<RTCRtpReceiver>,
}

impl InboundTrack {
    pub fn new(track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>) -> Self {
        Self { track, receiver }
    }

    pub fn track(&self) -> &Arc<TrackRemote> {
        &self.track
    }
}

impl PacketSource for InboundTrack {
    fn is_audio(&self) -> bool {
        self.track.kind() == RTPCodecType::Audio
    }

    async fn read_packet(&self) -> Result<Packet, RelayError> {
        self.track
            .read_rtp()
            .await
            .map(|(packet, _attributes)| packet)
            .map_err(read_error)
    }

    async fn drain_feedback(&self) -> Result<(), RelayError> {
        let mut buf = vec![0u8; RTCP_BUFFER_SIZE];
        self.receiver.read(&mut buf).await.map(|_| ()).map_err(read_error)
    }
}

impl PacketSink for TrackLocalStaticRTP {
    async fn write_packet(&self, packet: &Packet) -> Result<(), RelayError> {
        self.write_rtp(packet).await.map(|_| ()).map_err(write_error)
    }
}

/// Represents a single negotiated participant
pub struct Peer {
    /// Unique peer identifier
    pub id: u64,
    room_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    /// Outgoing audio track (partner -> this participant)
    outbound: Arc<TrackLocalStaticRTP>,
    /// Holds the inbound track once on_track fires
    inbound_tx: watch::Sender<Option<Arc<InboundTrack>>>,
    session_state: Mutex<SessionState>,
    state: Mutex<PeerState>,
}

impl Peer {
    /// Create a new peer connection for `room_id` with its outbound track
    /// attached and callbacks wired to the supervisor's event channel.
    pub async fn new(
        api: &API,
        config: RTCConfiguration,
        room_id: &str,
        events: EventSender<Peer>,
    ) -> Result<Arc<Self>, PeerError> {
        let id = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(webrtc_err("Failed to create peer connection"))?,
        );

        let outbound = attach_outbound_track(&peer_connection, format!("voice-relay-{}", id)).await?;

        let (inbound_tx, _) = watch::channel(None);

        let peer = Arc::new_cyclic(|weak: &Weak<Peer>| {
            install_handlers(&peer_connection, weak, events);
            Peer {
                id,
                room_id: room_id.to_string(),
                peer_connection: peer_connection.clone(),
                outbound,
                inbound_tx,
                session_state: Mutex::new(SessionState::OfferReceived),
                state: Mutex::new(PeerState::Waiting),
            }
        });

        log::debug!("[Peer {}] Created for room '{}'", id, room_id);
        Ok(peer)
    }

    /// Apply a remote offer and return the answer with all candidates
    /// gathered (no trickle).
    pub async fn accept_offer(&self, offer_sdp: &str) -> Result<String, PeerError> {
        self.advance(SessionState::Negotiating);

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(webrtc_err("Invalid offer SDP"))?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(webrtc_err("Failed to set remote description"))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(webrtc_err("Failed to create answer"))?;

        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(webrtc_err("Failed to set local description"))?;
        let _ = gathering_complete.recv().await;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or(PeerError::NoLocalDescription)?;

        self.advance(SessionState::Answered);
        Ok(local.sdp)
    }

    /// Move the session forward; never backwards
    fn advance(&self, next: SessionState) {
        let mut current = self.session_state.lock();
        if next > *current {
            *current = next;
        }
    }

    pub fn session_state(&self) -> SessionState {
        *self.session_state.lock()
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

fn install_handlers(peer_connection: &Arc<RTCPeerConnection>, weak: &Weak<Peer>, events: EventSender<Peer>) {
    let track_peer = weak.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            if let Some(peer) = track_peer.upgrade() {
                if track.kind() == RTPCodecType::Audio {
                    log::info!("[Peer {}] Inbound audio track ({})", peer.id, track.codec().capability.mime_type);
                    peer.inbound_tx.send_replace(Some(Arc::new(InboundTrack::new(track, receiver))));
                } else {
                    log::info!("[Peer {}] Ignoring {} track", peer.id, track.kind());
                }
            }
            Box::pin(async {})
        },
    ));

    let state_peer = weak.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        if let Some(state) = SessionState::from_connection_state(s) {
            if let Some(peer) = state_peer.upgrade() {
                log::info!("[Peer {}] Session {}", peer.id, state);
                peer.advance(state);
            }
            let _ = events.send(SessionEvent {
                peer: state_peer.clone(),
                state,
            });
        }
        Box::pin(async {})
    }));

    close_on_ice_failure(peer_connection, "Peer");
}

/// Close the connection once ICE fails, so pending track reads end.
pub fn close_on_ice_failure(peer_connection: &Arc<RTCPeerConnection>, label: &'static str) {
    let ice_pc = Arc::downgrade(peer_connection);
    peer_connection.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        if s == RTCIceConnectionState::Failed {
            if let Some(pc) = ice_pc.upgrade() {
                log::warn!("[{}] ICE failed, closing connection", label);
                tokio::spawn(async move {
                    let _ = pc.close().await;
                });
            }
        }
        Box::pin(async {})
    }));
}

impl RelayPeer for Peer {
    type Source = InboundTrack;
    type Sink = TrackLocalStaticRTP;

    fn inbound(&self) -> watch::Receiver<Option<Arc<InboundTrack>>> {
        self.inbound_tx.subscribe()
    }

    fn outbound(&self) -> Arc<TrackLocalStaticRTP> {
        self.outbound.clone()
    }
}

impl SessionPeer for Peer {
    fn room_id(&self) -> &str {
        &self.room_id
    }

    fn set_state(&self, state: PeerState) {
        *self.state.lock() = state;
    }

    async fn close(&self) {
        if let Err(e) = self.peer_connection.close().await {
            log::warn!("[Peer {}] Failed to close peer connection: {}", self.id, e);
        }
    }
}

/// Builds relay-side peers from WHIP offers
pub struct Negotiator {
    api: API,
    ice_servers: Vec<IceServerConfig>,
}

impl Negotiator {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Result<Self, PeerError> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }

    /// Negotiate one offer into a peer and its answer SDP.
    ///
    /// On failure the half-built session is closed before returning.
    pub async fn answer(
        &self,
        room_id: &str,
        offer_sdp: &str,
        events: &EventSender<Peer>,
    ) -> Result<(Arc<Peer>, String), PeerError> {
        let peer = Peer::new(&self.api, build_rtc_config(&self.ice_servers), room_id, events.clone()).await?;
        match peer.accept_offer(offer_sdp).await {
            Ok(answer) => Ok((peer, answer)),
            Err(e) => {
                peer.close().await;
                Err(e)
            }
        }
    }
}
