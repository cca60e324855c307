//! Relay server: WHIP endpoint, room registry, relay engine and the session
//! supervisor wired together.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::ice::{google_stun_servers, IceServerConfig};
use crate::peer::{event_channel, Negotiator, Peer, Registry, Supervisor};
use crate::signaling::{SignalingError, SignalingState, WhipConfig, WhipEndpoint};
use crate::stream::RelayEngine;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub whip: WhipConfig,
    /// ICE servers offered to every peer connection
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            whip: WhipConfig::default(),
            ice_servers: google_stun_servers(),
        }
    }
}

/// Running relay server
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<Registry<Peer>>,
    relay: Arc<RelayEngine>,
    endpoint: Option<WhipEndpoint>,
    supervisor: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::new()),
            relay: Arc::new(RelayEngine::new()),
            endpoint: None,
            supervisor: None,
        }
    }

    /// Start the supervisor and the WHIP endpoint. Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr, SignalingError> {
        let negotiator = Negotiator::new(self.config.ice_servers.clone())?;
        let (events, event_rx) = event_channel();

        let supervisor = Supervisor::new(self.registry.clone(), self.relay.clone());
        self.supervisor = Some(tokio::spawn(supervisor.run(event_rx)));

        let state = Arc::new(SignalingState {
            registry: self.registry.clone(),
            relay: self.relay.clone(),
            negotiator: Arc::new(negotiator),
            events,
            path: self.config.whip.path.clone(),
        });

        let mut endpoint = WhipEndpoint::new(self.config.whip.clone(), state);
        let addr = endpoint.start().await?;
        self.endpoint = Some(endpoint);

        log::info!(
            "[Relay] Started with {} ICE server(s)",
            self.config.ice_servers.len()
        );
        Ok(addr)
    }

    /// Stop accepting offers and cancel every relay task
    pub fn stop(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.stop();
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        log::info!("[Relay] Stopped ({} relay tasks cancelled)", self.relay.active_tasks());
    }

    pub fn registry(&self) -> &Arc<Registry<Peer>> {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<RelayEngine> {
        &self.relay
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerState, Slot};
    use crate::signaling::{whip_endpoint, WhipClient, WhipClientError};
    use crate::stream::Direction;
    use hyper::StatusCode;

    fn local_config() -> RelayConfig {
        RelayConfig {
            whip: WhipConfig {
                bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..Default::default()
            },
            ice_servers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_client_joins_room() {
        let mut server = RelayServer::new(local_config());
        let addr = server.start().await.unwrap();

        let endpoint = whip_endpoint(&addr.to_string(), "lobby").unwrap();
        let client = WhipClient::connect(&endpoint, &[]).await.unwrap();

        assert_eq!(client.resource_url(), Some(format!("http://{}/whip", addr).as_str()));
        let room = server.registry().get_room("lobby").unwrap();
        assert!(!room.is_empty());
        assert!(!room.is_full());
        assert_eq!(server.relay().active_tasks(), 0);

        client.close().await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_second_client_pairs_and_third_is_rejected() {
        let mut server = RelayServer::new(local_config());
        let addr = server.start().await.unwrap();
        let endpoint = whip_endpoint(&addr.to_string(), "duo").unwrap();

        let first = WhipClient::connect(&endpoint, &[]).await.unwrap();
        let room = server.registry().get_room("duo").unwrap();
        assert!(!room.is_full());
        assert_eq!(server.relay().active_tasks(), 0);

        let second = WhipClient::connect(&endpoint, &[]).await.unwrap();
        assert!(room.is_full());
        assert_eq!(server.relay().active_tasks(), 2);
        assert!(server.relay().has_task("duo", Direction::AToB));
        assert!(server.relay().has_task("duo", Direction::BToA));
        for slot in [Slot::A, Slot::B] {
            assert_eq!(room.slot(slot).unwrap().state(), PeerState::Paired);
        }

        let err = match WhipClient::connect(&endpoint, &[]).await {
            Ok(_) => panic!("third peer was accepted"),
            Err(e) => e,
        };
        match err {
            WhipClientError::Status { status, body } => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert!(body.contains("duo"));
            }
            other => panic!("expected status error, got {:?}", other),
        }
        assert!(room.is_full());
        assert_eq!(server.relay().active_tasks(), 2);

        first.close().await.unwrap();
        second.close().await.unwrap();
        server.stop();
    }

    #[tokio::test]
    async fn test_missing_room_over_http() {
        let mut server = RelayServer::new(local_config());
        let addr = server.start().await.unwrap();

        let err = match WhipClient::connect(&format!("http://{}/whip", addr), &[]).await {
            Ok(_) => panic!("offer without a room was accepted"),
            Err(e) => e,
        };
        match err {
            WhipClientError::Status { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "missing room parameter");
            }
            other => panic!("expected status error, got {:?}", other),
        }
        assert_eq!(server.registry().room_count(), 0);
    }
}
