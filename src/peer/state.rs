//! Session and peer lifecycle states.

use std::fmt;

use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Signaling/media session lifecycle, in transition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    OfferReceived,
    Negotiating,
    Answered,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    /// Closed and Failed end the session
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Map a connection state change to a session transition. States that do
    /// not move the session (new, connecting, disconnected) map to None.
    pub fn from_connection_state(state: RTCPeerConnectionState) -> Option<SessionState> {
        match state {
            RTCPeerConnectionState::Connected => Some(SessionState::Connected),
            RTCPeerConnectionState::Failed => Some(SessionState::Failed),
            RTCPeerConnectionState::Closed => Some(SessionState::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::OfferReceived => "offer-received",
            SessionState::Negotiating => "negotiating",
            SessionState::Answered => "answered",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A peer's position in its room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Waiting,
    Paired,
    Closed,
}
