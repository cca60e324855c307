//! Session supervisor.
//!
//! Connection-state callbacks only emit [`SessionEvent`]s; this task owns the
//! cleanup that follows a session ending: remove the peer from its room,
//! cancel the room's relay, close the session.

use std::future::Future;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use super::registry::Registry;
use super::state::{PeerState, SessionState};
use crate::stream::relay::{RelayEngine, RelayPeer};

/// A peer whose session the supervisor can tear down
pub trait SessionPeer: RelayPeer {
    fn room_id(&self) -> &str;

    fn set_state(&self, state: PeerState);

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// State change reported by a session callback
pub struct SessionEvent<P> {
    pub peer: Weak<P>,
    pub state: SessionState,
}

pub type EventSender<P> = mpsc::UnboundedSender<SessionEvent<P>>;
pub type EventReceiver<P> = mpsc::UnboundedReceiver<SessionEvent<P>>;

pub fn event_channel<P>() -> (EventSender<P>, EventReceiver<P>) {
    mpsc::unbounded_channel()
}

pub struct Supervisor<P> {
    registry: Arc<Registry<P>>,
    relay: Arc<RelayEngine>,
}

impl<P: SessionPeer> Supervisor<P> {
    pub fn new(registry: Arc<Registry<P>>, relay: Arc<RelayEngine>) -> Self {
        Self { registry, relay }
    }

    /// Consume events until every sender is gone
    pub async fn run(self, mut events: EventReceiver<P>) {
        log::info!("[Supervisor] Started");
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        log::info!("[Supervisor] Event channel closed, stopping");
    }

    pub async fn handle_event(&self, event: SessionEvent<P>) {
        let Some(peer) = event.peer.upgrade() else {
            return;
        };
        log::debug!("[Supervisor] Session in room '{}' is {}", peer.room_id(), event.state);
        if event.state.is_terminal() {
            self.end_session(&peer).await;
        }
    }

    /// Remove the peer, stop its room's relay and close the session.
    pub async fn end_session(&self, peer: &Arc<P>) {
        let room_id = peer.room_id().to_string();
        peer.set_state(PeerState::Closed);

        if self.registry.remove_peer(&room_id, peer) {
            self.relay.cancel_room(&room_id);
            if let Some(partner) = self
                .registry
                .get_room(&room_id)
                .and_then(|room| room.remaining_peer())
            {
                partner.set_state(PeerState::Waiting);
                log::info!("[Supervisor] Partner in room '{}' is waiting again", room_id);
            }
        }

        peer.close().await;
    }
}
