//! WHIP (WebRTC-HTTP Ingestion Protocol) server endpoint.
//!
//! Every POST carries one peer's SDP offer for a room:
//! 1. negotiate a peer connection and gather all candidates
//! 2. register the peer in its room
//! 3. if that paired the room, start the relay between the two peers
//! 4. answer 201 with the final SDP

use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{
    HeaderName, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_TYPE, LOCATION,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::build_response;
use crate::peer::{AddOutcome, EventSender, Negotiator, Peer, PeerError, PeerState, Registry, SessionPeer, Supervisor};
use crate::stream::RelayEngine;

/// WHIP endpoint errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("missing room parameter")]
    MissingRoom,

    #[error("invalid offer body: {0}")]
    InvalidBody(String),

    #[error("room '{0}' is full")]
    RoomFull(String),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] PeerError),

    #[error("failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

impl SignalingError {
    /// HTTP status answered for this error
    pub fn status(&self) -> StatusCode {
        match self {
            SignalingError::MissingRoom | SignalingError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            SignalingError::RoomFull(_) => StatusCode::CONFLICT,
            SignalingError::Negotiation(_) | SignalingError::Bind(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// WHIP endpoint configuration
#[derive(Debug, Clone)]
pub struct WhipConfig {
    /// Listen address (default 0.0.0.0:8080)
    pub bind_addr: SocketAddr,
    /// Endpoint path (default "/whip")
    pub path: String,
}

impl Default for WhipConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path: "/whip".to_string(),
        }
    }
}

/// Everything a request handler needs
pub struct SignalingState {
    pub registry: Arc<Registry<Peer>>,
    pub relay: Arc<RelayEngine>,
    pub negotiator: Arc<Negotiator>,
    pub events: EventSender<Peer>,
    pub path: String,
}

/// CORS headers carried by every WHIP response
fn cors_headers() -> [(HeaderName, &'static str); 3] {
    [
        (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (ACCESS_CONTROL_ALLOW_METHODS, "POST"),
        (ACCESS_CONTROL_ALLOW_HEADERS, "*, Authorization"),
    ]
}

/// WHIP endpoint handler
pub struct WhipEndpoint {
    config: WhipConfig,
    state: Arc<SignalingState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl WhipEndpoint {
    /// Create a new WHIP endpoint
    pub fn new(config: WhipConfig, state: Arc<SignalingState>) -> Self {
        Self {
            config,
            state,
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Start the WHIP HTTP server. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, SignalingError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);

        let state = self.state.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, remote)) => {
                                let io = TokioIo::new(stream);
                                let state = state.clone();

                                tokio::spawn(async move {
                                    let service = service_fn(move |req| {
                                        let state = state.clone();
                                        async move { handle_request(req, state).await }
                                    });

                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        log::warn!("[WHIP] Connection error from {}: {}", remote, e);
                                    }
                                });
                            }
                            Err(e) => {
                                log::error!("[WHIP] Accept error: {}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
            log::info!("[WHIP] Server stopped");
        });

        log::info!("[WHIP] Listening on http://{}{}", local_addr, self.config.path);
        Ok(local_addr)
    }

    /// Stop the WHIP HTTP server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for WhipEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `room` query parameter, if present and non-empty
pub fn room_param(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "room")
        .map(|(_, value)| value.into_owned())
        .filter(|room| !room.is_empty())
}

/// Handle incoming HTTP request
pub async fn handle_request<B>(
    req: Request<B>,
    state: Arc<SignalingState>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Display,
{
    if req.uri().path() != state.path {
        return Ok(build_response(StatusCode::NOT_FOUND, &[], "Not Found"));
    }

    let method = req.method().clone();
    let response = match method {
        // OPTIONS - CORS preflight
        Method::OPTIONS => build_response(StatusCode::OK, &cors_headers(), Bytes::new()),

        Method::POST => match handle_offer(req, &state).await {
            Ok(answer) => {
                let mut headers: Vec<(HeaderName, &str)> = cors_headers().to_vec();
                headers.push((CONTENT_TYPE, "application/sdp"));
                headers.push((LOCATION, state.path.as_str()));
                build_response(StatusCode::CREATED, &headers, answer)
            }
            Err(e) => {
                log::warn!("[WHIP] Offer rejected: {}", e);
                build_response(e.status(), &cors_headers(), e.to_string())
            }
        },

        _ => build_response(StatusCode::METHOD_NOT_ALLOWED, &cors_headers(), "Method Not Allowed"),
    };

    Ok(response)
}

/// Negotiate, register and (when the room pairs) start the relay.
async fn handle_offer<B>(req: Request<B>, state: &SignalingState) -> Result<String, SignalingError>
where
    B: Body,
    B::Error: Display,
{
    let room_id = room_param(req.uri()).ok_or(SignalingError::MissingRoom)?;

    // Don't bother negotiating for a room that cannot take another peer
    if state.registry.get_room(&room_id).is_some_and(|room| room.is_full()) {
        return Err(SignalingError::RoomFull(room_id));
    }

    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| SignalingError::InvalidBody(e.to_string()))?
        .to_bytes();
    let offer = String::from_utf8(body.to_vec())
        .map_err(|_| SignalingError::InvalidBody("offer is not valid UTF-8".to_string()))?;

    log::info!("[WHIP] Offer for room '{}' ({} bytes)", room_id, offer.len());
    let (peer, answer) = state.negotiator.answer(&room_id, &offer, &state.events).await?;

    let room = state.registry.get_or_create_room(&room_id);
    match state.registry.add_peer(&room, peer.clone()) {
        AddOutcome::Waiting => peer.set_state(PeerState::Waiting),
        AddOutcome::Paired(partner) => {
            partner.set_state(PeerState::Paired);
            peer.set_state(PeerState::Paired);
            state.relay.start_pair(&room_id, &partner, &peer);
        }
        AddOutcome::Full => {
            peer.close().await;
            return Err(SignalingError::RoomFull(room_id));
        }
    }

    // A session that ended while negotiating was not in the room when its
    // event was handled; clean it up now.
    if peer.session_state().is_terminal() {
        Supervisor::new(state.registry.clone(), state.relay.clone())
            .end_session(&peer)
            .await;
    }

    log::info!("[WHIP] Peer {} joined room '{}'", peer.id, room_id);
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::connection::build_api;
    use crate::peer::event_channel;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    fn test_state() -> Arc<SignalingState> {
        let (events, _rx) = event_channel();
        Arc::new(SignalingState {
            registry: Arc::new(Registry::new()),
            relay: Arc::new(RelayEngine::new()),
            negotiator: Arc::new(Negotiator::new(Vec::new()).unwrap()),
            events,
            path: "/whip".to_string(),
        })
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/sdp")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_string(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_room_param() {
        let uri: Uri = "/whip?room=a%20b&x=1".parse().unwrap();
        assert_eq!(room_param(&uri), Some("a b".to_string()));
        let uri: Uri = "/whip?room=".parse().unwrap();
        assert_eq!(room_param(&uri), None);
        let uri: Uri = "/whip".parse().unwrap();
        assert_eq!(room_param(&uri), None);
    }

    #[tokio::test]
    async fn test_missing_room_is_bad_request() {
        let state = test_state();
        let response = handle_request(request(Method::POST, "/whip", "v=0"), state.clone())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(state.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_options_preflight() {
        let response = handle_request(request(Method::OPTIONS, "/whip", ""), test_state())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], "POST");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_HEADERS], "*, Authorization");
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let state = test_state();
        let response = handle_request(request(Method::POST, "/other?room=x", ""), state.clone())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handle_request(request(Method::GET, "/whip?room=x", ""), state)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn test_bad_offer_is_server_error_without_registration() {
        let state = test_state();
        let response = handle_request(request(Method::POST, "/whip?room=r1", "not an sdp"), state.clone())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_full_room_is_conflict() {
        let state = test_state();
        let api = build_api().unwrap();
        let room = state.registry.get_or_create_room("full");
        for _ in 0..2 {
            let peer = Peer::new(&api, RTCConfiguration::default(), "full", state.events.clone())
                .await
                .unwrap();
            state.registry.add_peer(&room, peer);
        }

        let response = handle_request(request(Method::POST, "/whip?room=full", "v=0"), state.clone())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_string(response).await.contains("full"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(SignalingError::MissingRoom.status(), StatusCode::BAD_REQUEST);
        assert_eq!(SignalingError::InvalidBody("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(SignalingError::RoomFull("r".into()).status(), StatusCode::CONFLICT);
    }
}
