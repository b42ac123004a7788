//! Room lookup: create on first join, retire when empty.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::room::Room;
use crate::proto::ServerFrame;

/// Maps room ids to live rooms. Joins and retirement both run under the
/// directory lock, so a join can never land in a room that retirement has
/// already dropped from the map.
#[derive(Default)]
pub struct RoomDirectory {
    rooms: Mutex<HashMap<String, Arc<Mutex<Room>>>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` in the room, creating the room on first join.
    ///
    /// Returns the room and the join epoch; the connection hands both back
    /// when it leaves.
    pub async fn join(
        &self,
        room_id: &str,
        id: String,
        sink: mpsc::Sender<ServerFrame>,
    ) -> (Arc<Mutex<Room>>, u64) {
        let mut rooms = self.rooms.lock().await;
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room = %room_id, "creating room");
                Arc::new(Mutex::new(Room::new(room_id.to_string())))
            })
            .clone();
        let epoch = room.lock().await.handle_join(id, sink);
        (room, epoch)
    }

    /// Look a room up without creating it.
    pub async fn find(&self, room_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    /// Drop the room if its participant count reached zero.
    pub async fn retire_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.lock().await;
        let empty = match rooms.get(room_id) {
            Some(room) => room.lock().await.is_empty(),
            None => return,
        };
        if empty {
            rooms.remove(room_id);
            debug!(room = %room_id, "retired empty room");
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}
