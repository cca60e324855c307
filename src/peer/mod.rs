//! Peer connections, rooms and session supervision.

pub mod connection;
pub mod registry;
pub mod state;
pub mod supervisor;

pub use connection::{InboundTrack, Negotiator, Peer, PeerError};
pub use registry::{AddOutcome, Registry, Room, Slot};
pub use state::{PeerState, SessionState};
pub use supervisor::{event_channel, EventReceiver, EventSender, SessionEvent, SessionPeer, Supervisor};
