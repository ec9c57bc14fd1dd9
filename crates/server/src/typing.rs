use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::{RoomId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::Mutex;

use crate::hub::RoomHub;

/// Ephemeral typing state: one generation-counted entry per (room, user).
/// A signal refreshes the entry and schedules an expiry task; the task only
/// emits `stop_typing` when its generation is still current, so refreshed or
/// explicitly stopped entries silently cancel stale timers. Nothing here is
/// persisted; a restart clears all typing state.
pub struct TypingCoordinator {
    hub: Arc<RoomHub>,
    entries: Arc<Mutex<HashMap<(RoomId, UserId), u64>>>,
    generation: AtomicU64,
    ttl: Duration,
}

impl TypingCoordinator {
    pub fn new(hub: Arc<RoomHub>, ttl: Duration) -> Self {
        Self {
            hub,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            ttl,
        }
    }

    /// Starts or refreshes the typing timer. `typing` is broadcast only on
    /// the fresh start, not on every refresh.
    pub async fn signal(self: &Arc<Self>, room_id: RoomId, user_id: UserId) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let fresh = {
            let mut entries = self.entries.lock().await;
            entries.insert((room_id, user_id), generation).is_none()
        };

        if fresh {
            self.hub
                .publish(room_id, ServerEvent::Typing { room_id, user_id })
                .await;
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(coordinator.ttl).await;
            coordinator.expire(room_id, user_id, generation).await;
        });
    }

    pub async fn explicit_stop(&self, room_id: RoomId, user_id: UserId) {
        let removed = {
            let mut entries = self.entries.lock().await;
            entries.remove(&(room_id, user_id)).is_some()
        };
        if removed {
            self.hub
                .publish(room_id, ServerEvent::StopTyping { room_id, user_id })
                .await;
        }
    }

    pub async fn is_typing(&self, room_id: RoomId, user_id: UserId) -> bool {
        let typing = self.entries.lock().await.contains_key(&(room_id, user_id));
        typing
    }

    async fn expire(&self, room_id: RoomId, user_id: UserId, generation: u64) {
        let expired = {
            let mut entries = self.entries.lock().await;
            match entries.get(&(room_id, user_id)) {
                Some(current) if *current == generation => {
                    entries.remove(&(room_id, user_id));
                    true
                }
                _ => false,
            }
        };
        if expired {
            self.hub
                .publish(room_id, ServerEvent::StopTyping { room_id, user_id })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn coordinator(ttl_ms: u64) -> (Arc<TypingCoordinator>, Arc<RoomHub>) {
        let hub = Arc::new(RoomHub::new(16));
        let typing = Arc::new(TypingCoordinator::new(
            hub.clone(),
            Duration::from_millis(ttl_ms),
        ));
        (typing, hub)
    }

    #[tokio::test]
    async fn unrefreshed_signal_expires_into_stop_typing() {
        let (typing, hub) = coordinator(30);
        let (tx, mut rx) = hub.outbound_channel();
        hub.join(RoomId(1), 1, tx).await;

        typing.signal(RoomId(1), UserId(7)).await;
        assert!(matches!(rx.recv().await, Ok(ServerEvent::Typing { .. })));
        assert!(typing.is_typing(RoomId(1), UserId(7)).await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::StopTyping { .. })));
        assert!(!typing.is_typing(RoomId(1), UserId(7)).await);
    }

    #[tokio::test]
    async fn refresh_postpones_expiry_without_rebroadcasting_typing() {
        let (typing, hub) = coordinator(60);
        let (tx, mut rx) = hub.outbound_channel();
        hub.join(RoomId(1), 1, tx).await;

        typing.signal(RoomId(1), UserId(7)).await;
        assert!(matches!(rx.recv().await, Ok(ServerEvent::Typing { .. })));

        tokio::time::sleep(Duration::from_millis(40)).await;
        typing.signal(RoomId(1), UserId(7)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        // First timer fired in this window but its generation was stale.
        assert!(typing.is_typing(RoomId(1), UserId(7)).await);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::StopTyping { .. })));
    }

    #[tokio::test]
    async fn explicit_stop_cancels_the_timer_immediately() {
        let (typing, hub) = coordinator(5_000);
        let (tx, mut rx) = hub.outbound_channel();
        hub.join(RoomId(1), 1, tx).await;

        typing.signal(RoomId(1), UserId(7)).await;
        assert!(matches!(rx.recv().await, Ok(ServerEvent::Typing { .. })));

        typing.explicit_stop(RoomId(1), UserId(7)).await;
        assert!(matches!(rx.recv().await, Ok(ServerEvent::StopTyping { .. })));
        assert!(!typing.is_typing(RoomId(1), UserId(7)).await);
    }

    #[tokio::test]
    async fn stop_without_signal_emits_nothing() {
        let (typing, hub) = coordinator(1_000);
        let (tx, mut rx) = hub.outbound_channel();
        hub.join(RoomId(1), 1, tx).await;

        typing.explicit_stop(RoomId(1), UserId(7)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }
}
