//! Room registry
//!
//! Sole owner of all live rooms. Rooms are created on first access and
//! removed as soon as they are empty.
//!
//! Lock order is registry map, then room. Eviction flags the room while
//! holding both, and a join that finds a flagged room goes back through
//! `get_or_create`, so a room with members is never missing from the map.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::room::{JoinOutcome, Room};
use crate::session::SessionTable;
use crate::types::{RoomId, SessionId, UserId};

/// All live rooms keyed by id
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the room for `room_id`, creating it if absent
    ///
    /// `title` and `host` only apply when the room is created here.
    pub async fn get_or_create(
        &self,
        room_id: RoomId,
        title: Option<String>,
        host: Option<UserId>,
    ) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(room_id)
            .or_insert_with(|| {
                info!("Room {} created", room_id);
                Arc::new(Room::new(room_id, title, host))
            })
            .clone()
    }

    /// Insert a new room under `room_id`
    ///
    /// Returns `None` if a room with that id is already live.
    pub async fn create(&self, room_id: RoomId, title: String, host: UserId) -> Option<Arc<Room>> {
        let mut rooms = self.rooms.lock().await;
        match rooms.entry(room_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                info!("Room {} created by user {}", room_id, host);
                let room = Arc::new(Room::new(room_id, Some(title), Some(host)));
                Some(slot.insert(room).clone())
            }
        }
    }

    /// Look up a live room
    pub async fn get(&self, room_id: RoomId) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(&room_id).cloned()
    }

    /// Join `session_id` to `room_id`, creating the room if needed
    pub async fn join(
        &self,
        room_id: RoomId,
        session_id: SessionId,
        user_id: Option<UserId>,
        title: Option<String>,
        host: Option<UserId>,
        sessions: &SessionTable,
    ) -> (Arc<Room>, JoinOutcome) {
        loop {
            let room = self.get_or_create(room_id, title.clone(), host).await;
            match room.join(session_id, user_id, sessions).await {
                Ok(outcome) => return (room, outcome),
                Err(_) => debug!("Room {} evicted during join, retrying", room_id),
            }
        }
    }

    /// Remove the room iff it has no members
    pub async fn evict_if_empty(&self, room_id: RoomId) -> bool {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(&room_id) else {
            return false;
        };
        if room.evict_if_empty().await {
            rooms.remove(&room_id);
            info!("Room {} has been removed (no members)", room_id);
            true
        } else {
            false
        }
    }

    pub async fn len(&self) -> usize {
        self.rooms.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.lock().await.is_empty()
    }
}
