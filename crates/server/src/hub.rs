use std::{collections::HashMap, sync::Arc};

use shared::{domain::RoomId, protocol::ServerEvent};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

pub type ConnectionId = u64;

/// A connection's bounded outbound queue. `tokio::sync::broadcast` with a
/// single subscriber gives exactly the backpressure contract we want: the
/// publisher never blocks, and a lagging consumer loses its oldest queued
/// events (reported as `RecvError::Lagged` on its receiver) without
/// affecting any other connection.
pub type OutboundSender = broadcast::Sender<ServerEvent>;

/// Fan-out dispatcher: one topic per room, joined connections registered by
/// id. Access control happened before a connection was joined; the hub never
/// re-derives it.
pub struct RoomHub {
    topics: RwLock<HashMap<RoomId, Arc<RoomTopic>>>,
    queue_capacity: usize,
}

pub struct RoomTopic {
    /// Held across persist-then-publish so every viewer observes room events
    /// in the order persistence completed.
    pub append_lock: Mutex<()>,
    subscribers: Mutex<HashMap<ConnectionId, OutboundSender>>,
}

impl RoomHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    pub fn outbound_channel(&self) -> (OutboundSender, broadcast::Receiver<ServerEvent>) {
        broadcast::channel(self.queue_capacity)
    }

    pub async fn topic(&self, room_id: RoomId) -> Arc<RoomTopic> {
        if let Some(topic) = self.topics.read().await.get(&room_id) {
            return topic.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(room_id)
            .or_insert_with(|| {
                Arc::new(RoomTopic {
                    append_lock: Mutex::new(()),
                    subscribers: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    pub async fn join(&self, room_id: RoomId, connection_id: ConnectionId, tx: OutboundSender) {
        let topic = self.topic(room_id).await;
        topic.subscribers.lock().await.insert(connection_id, tx);
    }

    pub async fn leave(&self, room_id: RoomId, connection_id: ConnectionId) {
        let topic = self.topic(room_id).await;
        topic.subscribers.lock().await.remove(&connection_id);
    }

    /// Best-effort delivery to every connection currently joined to the
    /// room. A send only fails when the connection's receive task is gone,
    /// which its own teardown handles.
    pub async fn publish(&self, room_id: RoomId, event: ServerEvent) {
        let topic = self.topic(room_id).await;
        let subscribers = topic.subscribers.lock().await;
        debug!(room_id = room_id.0, receivers = subscribers.len(), "publish");
        for tx in subscribers.values() {
            let _ = tx.send(event.clone());
        }
    }

    pub async fn subscriber_count(&self, room_id: RoomId) -> usize {
        let topic = self.topic(room_id).await;
        let count = topic.subscribers.lock().await.len();
        count
    }
}
