//! ICE (Interactive Connectivity Establishment) configuration.
//!
//! Provides helpers for configuring STUN and TURN servers.

use webrtc::ice_transport::ice_server::RTCIceServer;

/// ICE server configuration (STUN or TURN)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a STUN-only server config
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// Create a TURN server config with credentials
    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    /// Convert to webrtc-rs RTCIceServer
    pub fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Default Google STUN server
pub fn google_stun_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig::stun("stun:stun.l.google.com:19302")]
}

/// Parse a comma-separated list of STUN URLs (as given in `STUN_URLS`).
///
/// Blank entries are ignored; an empty list falls back to Google STUN.
pub fn parse_stun_urls(list: &str) -> Vec<IceServerConfig> {
    let servers: Vec<IceServerConfig> = list
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServerConfig::stun)
        .collect();

    if servers.is_empty() {
        google_stun_servers()
    } else {
        servers
    }
}
