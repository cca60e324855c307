//! WHIP Client - opens one session against a WHIP relay.
//!
//! Flow:
//! 1. Create RTCPeerConnection with an Opus audio track
//! 2. Create SDP offer and wait for ICE gathering to complete
//! 3. POST offer to the WHIP endpoint
//! 4. Set remote answer from response
//! 5. Write RTP to the outbound track, read the partner's audio from the
//!    inbound track

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, LOCATION};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::sync::watch;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::ice::IceServerConfig;
use crate::peer::connection::{
    attach_outbound_track, build_api, build_rtc_config, close_on_ice_failure, InboundTrack, PeerError,
};
use crate::peer::SessionState;
use crate::stream::relay::wait_ready;

/// WHIP client errors
#[derive(Debug, Error)]
pub enum WhipClientError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("invalid WHIP endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("WHIP request failed: {0}")]
    Request(String),

    #[error("WHIP server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// `http://{server}/whip?room={room}`
pub fn whip_endpoint(server: &str, room: &str) -> Result<String, url::ParseError> {
    let mut url = url::Url::parse(&format!("http://{}/whip", server))?;
    url.query_pairs_mut().append_pair("room", room);
    Ok(url.to_string())
}

async fn wait_terminal(state: &mut watch::Receiver<SessionState>) {
    loop {
        if state.borrow_and_update().is_terminal() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// One WHIP session
pub struct WhipClient {
    /// WHIP endpoint URL
    endpoint_url: String,
    /// WebRTC peer connection
    peer_connection: Arc<RTCPeerConnection>,
    /// Outgoing audio track
    audio_track: Arc<TrackLocalStaticRTP>,
    /// Resource URL returned by server
    resource_url: Option<String>,
    /// Partner's audio, once it arrives
    inbound_rx: watch::Receiver<Option<Arc<InboundTrack>>>,
    /// Last session state reported by the connection
    state_rx: watch::Receiver<SessionState>,
}

impl WhipClient {
    /// Create and connect a new WHIP client.
    ///
    /// # Arguments
    /// * `endpoint_url` - WHIP endpoint URL (e.g., "http://127.0.0.1:8080/whip?room=demo")
    /// * `ice_servers` - List of ICE servers for NAT traversal
    pub async fn connect(endpoint_url: &str, ice_servers: &[IceServerConfig]) -> Result<Self, WhipClientError> {
        let api = build_api()?;
        let peer_connection = Arc::new(
            api.new_peer_connection(build_rtc_config(ice_servers))
                .await
                .map_err(|source| PeerError::WebRtc {
                    context: "Failed to create peer connection",
                    source,
                })?,
        );

        let audio_track = attach_outbound_track(&peer_connection, "voice-relay-client".to_owned()).await?;

        let (inbound_tx, inbound_rx) = watch::channel(None);
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                if track.kind() == RTPCodecType::Audio {
                    log::info!("[WhipClient] Inbound audio track");
                    inbound_tx.send_replace(Some(Arc::new(InboundTrack::new(track, receiver))));
                }
                Box::pin(async {})
            },
        ));

        let (state_tx, state_rx) = watch::channel(SessionState::Negotiating);
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if let Some(state) = SessionState::from_connection_state(s) {
                log::info!("[WhipClient] Session {}", state);
                state_tx.send_replace(state);
            }
            Box::pin(async {})
        }));
        close_on_ice_failure(&peer_connection, "WhipClient");

        let resource_url = match Self::negotiate(&peer_connection, endpoint_url).await {
            Ok(resource_url) => resource_url,
            Err(e) => {
                let _ = peer_connection.close().await;
                return Err(e);
            }
        };

        Ok(Self {
            endpoint_url: endpoint_url.to_string(),
            peer_connection,
            audio_track,
            resource_url,
            inbound_rx,
            state_rx,
        })
    }

    /// Offer, gather, POST, apply answer
    async fn negotiate(
        peer_connection: &RTCPeerConnection,
        endpoint_url: &str,
    ) -> Result<Option<String>, WhipClientError> {
        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|source| PeerError::WebRtc {
                context: "Failed to create offer",
                source,
            })?;

        let mut gathering_complete = peer_connection.gathering_complete_promise().await;
        peer_connection
            .set_local_description(offer)
            .await
            .map_err(|source| PeerError::WebRtc {
                context: "Failed to set local description",
                source,
            })?;
        let _ = gathering_complete.recv().await;

        let local_desc = peer_connection
            .local_description()
            .await
            .ok_or(PeerError::NoLocalDescription)?;

        let (answer_sdp, resource_url) = Self::post_offer(endpoint_url, &local_desc.sdp).await?;

        let answer = RTCSessionDescription::answer(answer_sdp).map_err(|source| PeerError::WebRtc {
            context: "Invalid answer SDP",
            source,
        })?;
        peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|source| PeerError::WebRtc {
                context: "Failed to set remote description",
                source,
            })?;

        Ok(resource_url)
    }

    /// POST SDP offer to WHIP endpoint
    async fn post_offer(endpoint_url: &str, offer_sdp: &str) -> Result<(String, Option<String>), WhipClientError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build(https);

        let request = Request::builder()
            .method(Method::POST)
            .uri(endpoint_url)
            .header(CONTENT_TYPE, "application/sdp")
            .body(Full::new(Bytes::from(offer_sdp.to_string())))
            .map_err(|e| WhipClientError::Request(e.to_string()))?;

        let response = client
            .request(request)
            .await
            .map_err(|e| WhipClientError::Request(e.to_string()))?;

        let status = response.status();

        // Location may be relative to the endpoint
        let resource_url = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| {
                url::Url::parse(endpoint_url)
                    .and_then(|base| base.join(s))
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| s.to_string())
            });

        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| WhipClientError::Request(e.to_string()))?
            .to_bytes();
        let body = String::from_utf8_lossy(&body_bytes).to_string();

        if status != StatusCode::CREATED && status != StatusCode::OK {
            return Err(WhipClientError::Status { status, body });
        }

        Ok((body, resource_url))
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub fn resource_url(&self) -> Option<&str> {
        self.resource_url.as_deref()
    }

    /// Get the audio track for writing packets
    pub fn audio_track(&self) -> &Arc<TrackLocalStaticRTP> {
        &self.audio_track
    }

    pub fn session_state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.session_state() == SessionState::Connected
    }

    /// Wait until the partner's audio track arrives. None if the session
    /// ends first.
    pub async fn wait_for_inbound(&self) -> Option<Arc<InboundTrack>> {
        let mut inbound = self.inbound_rx.clone();
        let mut state = self.state_rx.clone();
        tokio::select! {
            track = wait_ready(&mut inbound) => track,
            _ = wait_terminal(&mut state) => None,
        }
    }

    /// Wait until the session is closed or failed
    pub async fn wait_closed(&self) {
        let mut state = self.state_rx.clone();
        wait_terminal(&mut state).await;
    }

    /// Close the peer connection
    pub async fn close(&self) -> Result<(), WhipClientError> {
        self.peer_connection
            .close()
            .await
            .map_err(|source| PeerError::WebRtc {
                context: "Failed to close peer connection",
                source,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whip_endpoint_url() {
        assert_eq!(
            whip_endpoint("127.0.0.1:8080", "demo").unwrap(),
            "http://127.0.0.1:8080/whip?room=demo"
        );
        assert_eq!(
            whip_endpoint("relay.local:9000", "a b&c").unwrap(),
            "http://relay.local:9000/whip?room=a+b%26c"
        );
    }

    #[test]
    fn test_whip_endpoint_rejects_bad_host() {
        assert!(whip_endpoint("bad host:80", "demo").is_err());
    }
}
