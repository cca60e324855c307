//! Room and peer registry.
//!
//! Rooms are looked up by an opaque string id and hold at most two peers.
//! The id -> room map and each room's slots are guarded by separate locks, so
//! pairing in one room never blocks lookups of another.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// One of the two peer positions of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

/// Occupancy of a room
pub enum RoomState<P> {
    Empty,
    Waiting { slot: Slot, peer: Arc<P> },
    Paired { a: Arc<P>, b: Arc<P> },
}

/// Result of registering a peer
pub enum AddOutcome<P> {
    /// Registered, no partner yet
    Waiting,
    /// Registered and the room just became paired with this partner
    Paired(Arc<P>),
    /// Both slots already held; the peer was not registered
    Full,
}

impl<P> AddOutcome<P> {
    pub fn is_full(&self) -> bool {
        matches!(self, AddOutcome::Full)
    }
}

/// A two-slot pairing unit
pub struct Room<P> {
    id: String,
    state: Mutex<RoomState<P>>,
}

impl<P> Room<P> {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(RoomState::Empty),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peer currently held in `slot`
    pub fn slot(&self, slot: Slot) -> Option<Arc<P>> {
        match (&*self.state.lock(), slot) {
            (RoomState::Waiting { slot: held, peer }, wanted) if *held == wanted => Some(peer.clone()),
            (RoomState::Paired { a, .. }, Slot::A) => Some(a.clone()),
            (RoomState::Paired { b, .. }, Slot::B) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(&*self.state.lock(), RoomState::Paired { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(&*self.state.lock(), RoomState::Empty)
    }

    /// Place `peer` in the first free slot.
    ///
    /// The partner is returned exactly once, on the Waiting -> Paired
    /// transition.
    pub fn add_peer(&self, peer: Arc<P>) -> AddOutcome<P> {
        let mut state = self.state.lock();
        let (next, outcome) = match std::mem::replace(&mut *state, RoomState::Empty) {
            RoomState::Empty => (
                RoomState::Waiting { slot: Slot::A, peer },
                AddOutcome::Waiting,
            ),
            RoomState::Waiting { slot, peer: held } if Arc::ptr_eq(&held, &peer) => {
                (RoomState::Waiting { slot, peer: held }, AddOutcome::Waiting)
            }
            RoomState::Waiting { slot, peer: held } => {
                let partner = held.clone();
                let next = match slot {
                    Slot::A => RoomState::Paired { a: held, b: peer },
                    Slot::B => RoomState::Paired { a: peer, b: held },
                };
                (next, AddOutcome::Paired(partner))
            }
            paired @ RoomState::Paired { .. } => (paired, AddOutcome::Full),
        };
        *state = next;
        outcome
    }

    /// Clear the slot holding exactly this peer.
    ///
    /// Returns false when the peer is not in the room.
    pub fn remove_peer(&self, peer: &Arc<P>) -> bool {
        let mut state = self.state.lock();
        let (next, removed) = match std::mem::replace(&mut *state, RoomState::Empty) {
            RoomState::Waiting { peer: held, .. } if Arc::ptr_eq(&held, peer) => (RoomState::Empty, true),
            RoomState::Paired { a, b } if Arc::ptr_eq(&a, peer) => {
                (RoomState::Waiting { slot: Slot::B, peer: b }, true)
            }
            RoomState::Paired { a, b } if Arc::ptr_eq(&b, peer) => {
                (RoomState::Waiting { slot: Slot::A, peer: a }, true)
            }
            unchanged => (unchanged, false),
        };
        *state = next;
        removed
    }

    /// Peer left behind in the room, if any
    pub fn remaining_peer(&self) -> Option<Arc<P>> {
        match &*self.state.lock() {
            RoomState::Waiting { peer, .. } => Some(peer.clone()),
            _ => None,
        }
    }
}

/// Rooms by id. Rooms are created on first use and kept for the process
/// lifetime; an emptied room is reused by the next request for its id.
pub struct Registry<P> {
    rooms: Mutex<HashMap<String, Arc<Room<P>>>>,
}

impl<P> Registry<P> {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Existing room for `id`, or a new empty one
    pub fn get_or_create_room(&self, id: &str) -> Arc<Room<P>> {
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get(id) {
            return room.clone();
        }
        log::info!("[Registry] Created room '{}'", id);
        let room = Arc::new(Room::new(id));
        rooms.insert(id.to_string(), room.clone());
        room
    }

    pub fn get_room(&self, id: &str) -> Option<Arc<Room<P>>> {
        self.rooms.lock().get(id).cloned()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    /// Register `peer` in `room`
    pub fn add_peer(&self, room: &Room<P>, peer: Arc<P>) -> AddOutcome<P> {
        let outcome = room.add_peer(peer);
        match &outcome {
            AddOutcome::Waiting => log::info!("[Registry] Peer waiting in room '{}'", room.id()),
            AddOutcome::Paired(_) => log::info!("[Registry] Room '{}' paired", room.id()),
            AddOutcome::Full => log::warn!("[Registry] Room '{}' is full", room.id()),
        }
        outcome
    }

    /// Remove `peer` from the room with `room_id`. Unknown rooms and absent
    /// peers are a no-op.
    pub fn remove_peer(&self, room_id: &str, peer: &Arc<P>) -> bool {
        let Some(room) = self.get_room(room_id) else {
            return false;
        };
        let removed = room.remove_peer(peer);
        if removed {
            log::info!("[Registry] Peer removed from room '{}'", room_id);
        }
        removed
    }
}

impl<P> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}
