use std::{collections::HashMap, sync::Arc};

use shared::domain::{RoomId, UserId};
use tokio::sync::{Mutex, RwLock};

/// Per-room counts of a user's live connections. Derived state: a user is
/// online in a room while at least one connection is joined there. The
/// returned transition flags let the gateway emit `user_online` /
/// `user_offline` only on the 0→1 and 1→0 edges, so multi-tab clients do
/// not cause presence storms.
#[derive(Default)]
pub struct PresenceTracker {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<HashMap<UserId, usize>>>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn room(&self, room_id: RoomId) -> Arc<Mutex<HashMap<UserId, usize>>> {
        if let Some(room) = self.rooms.read().await.get(&room_id) {
            return room.clone();
        }
        let mut rooms = self.rooms.write().await;
        rooms.entry(room_id).or_default().clone()
    }

    /// Returns true when the user just came online in the room.
    pub async fn on_join(&self, room_id: RoomId, user_id: UserId) -> bool {
        let room = self.room(room_id).await;
        let mut counts = room.lock().await;
        let count = counts.entry(user_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when the user just went offline in the room. Idempotent
    /// for connections that were never counted.
    pub async fn on_leave(&self, room_id: RoomId, user_id: UserId) -> bool {
        let room = self.room(room_id).await;
        let mut counts = room.lock().await;
        match counts.get_mut(&user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(&user_id);
                true
            }
            None => false,
        }
    }

    pub async fn online_count(&self, room_id: RoomId) -> usize {
        let room = self.room(room_id).await;
        let count = room.lock().await.len();
        count
    }

    pub async fn is_online(&self, room_id: RoomId, user_id: UserId) -> bool {
        let room = self.room(room_id).await;
        let online = room.lock().await.contains_key(&user_id);
        online
    }

}
