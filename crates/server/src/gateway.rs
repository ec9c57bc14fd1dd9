use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use server_api::RoomResolution;
use shared::{
    domain::{Identity, RoomId},
    error::{ApiError, ErrorCode},
    protocol::{ClientRequest, RoomRef, ServerEvent},
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    hub::{ConnectionId, OutboundSender},
    AppState,
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Owns one client's bidirectional channel: a send task drains the bounded
/// outbound queue onto the socket, the receive loop handles requests, and
/// teardown clears room membership and presence. Nothing a disconnected
/// client missed is redelivered; catch-up is pagination on reconnect.
pub async fn ws_connection(state: Arc<AppState>, socket: WebSocket, identity: Identity) {
    let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (out_tx, out_rx) = state.hub.outbound_channel();
    let joined: Arc<Mutex<HashSet<RoomId>>> = Arc::new(Mutex::new(HashSet::new()));
    let last_seen_ms = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));

    info!(connection_id, user_id = identity.user_id.0, "connection established");

    let (ws_tx, ws_rx) = socket.split();
    let mut send_task = tokio::spawn(forward_outbound(
        ws_tx,
        out_rx,
        state.settings.lag_disconnect_limit,
        connection_id,
    ));

    let recv = receive_loop(
        state.clone(),
        ws_rx,
        connection_id,
        identity.clone(),
        out_tx.clone(),
        joined.clone(),
        last_seen_ms.clone(),
    );
    tokio::select! {
        _ = &mut send_task => {}
        _ = recv => {
            send_task.abort();
        }
    }

    teardown(&state, connection_id, &identity, &joined, &last_seen_ms).await;
    info!(connection_id, user_id = identity.user_id.0, "connection closed");
}

/// The only writer onto the client's socket. A lagged receiver means the
/// bounded queue overflowed and the oldest events were dropped for this
/// connection alone; past the configured budget the connection is forcibly
/// closed as the backpressure relief valve.
async fn forward_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: broadcast::Receiver<ServerEvent>,
    lag_disconnect_limit: u64,
    connection_id: ConnectionId,
) {
    let mut dropped: u64 = 0;
    loop {
        match out_rx.recv().await {
            Ok(event) => {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if ws_tx.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                dropped += skipped;
                warn!(connection_id, skipped, dropped, "outbound queue overflow; dropped oldest events");
                if dropped > lag_disconnect_limit {
                    warn!(connection_id, "consumer too far behind; forcing disconnect");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn receive_loop(
    state: Arc<AppState>,
    mut ws_rx: SplitStream<WebSocket>,
    connection_id: ConnectionId,
    identity: Identity,
    out_tx: OutboundSender,
    joined: Arc<Mutex<HashSet<RoomId>>>,
    last_seen_ms: Arc<AtomicI64>,
) {
    while let Some(Ok(message)) = ws_rx.next().await {
        last_seen_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        match message {
            Message::Text(text) => {
                let request = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => request,
                    Err(_) => {
                        notify(
                            &out_tx,
                            ServerEvent::Error(ApiError::new(
                                ErrorCode::Validation,
                                "malformed request",
                            )),
                        );
                        continue;
                    }
                };
                handle_request(&state, connection_id, &identity, &out_tx, &joined, request).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_request(
    state: &Arc<AppState>,
    connection_id: ConnectionId,
    identity: &Identity,
    out_tx: &OutboundSender,
    joined: &Arc<Mutex<HashSet<RoomId>>>,
    request: ClientRequest,
) {
    match request {
        ClientRequest::JoinRoom { room } => {
            join_room(state, connection_id, identity, out_tx, joined, room).await;
        }
        ClientRequest::LeaveRoom { room } => {
            leave_room(state, connection_id, identity, joined, room).await;
        }
        ClientRequest::Typing { room } => {
            if let Some(room_id) = joined_room_id(state, identity, out_tx, joined, room).await {
                state.typing.signal(room_id, identity.user_id).await;
            }
        }
        ClientRequest::StopTyping { room } => {
            if let Some(room_id) = joined_room_id(state, identity, out_tx, joined, room).await {
                state.typing.explicit_stop(room_id, identity.user_id).await;
            }
        }
        ClientRequest::Online {} => {
            // Activity touch only; presence is derived from join/leave.
            debug!(connection_id, "online touch");
        }
    }
}

/// Resolves and joins a room. Lock and not-found outcomes are reported to
/// this connection only; the channel stays open and no presence changes.
async fn join_room(
    state: &Arc<AppState>,
    connection_id: ConnectionId,
    identity: &Identity,
    out_tx: &OutboundSender,
    joined: &Arc<Mutex<HashSet<RoomId>>>,
    room_ref: RoomRef,
) {
    let timeout = Duration::from_millis(state.settings.join_timeout_ms);
    let resolved = match tokio::time::timeout(
        timeout,
        server_api::resolve_room(&state.api, identity, room_ref),
    )
    .await
    {
        Ok(Ok(resolution)) => resolution,
        Ok(Err(err)) => {
            notify(out_tx, ServerEvent::Error(err));
            return;
        }
        Err(_) => {
            notify(
                out_tx,
                ServerEvent::Error(ApiError::new(ErrorCode::NotFound, "room resolution timed out")),
            );
            return;
        }
    };

    let room = match resolved.granted() {
        Ok(room) => room,
        Err(err) => {
            notify(out_tx, ServerEvent::Error(err));
            return;
        }
    };

    let newly_joined = joined.lock().await.insert(room.room_id);
    if !newly_joined {
        return;
    }

    let room_id = room.room_id;
    state.hub.join(room_id, connection_id, out_tx.clone()).await;
    let came_online = state.presence.on_join(room_id, identity.user_id).await;
    let online = state.presence.online_count(room_id).await;
    info!(connection_id, room_id = room_id.0, online, "joined room");
    if came_online {
        state
            .hub
            .publish(
                room_id,
                ServerEvent::UserOnline {
                    room_id,
                    user_id: identity.user_id,
                },
            )
            .await;
    }

    match server_api::room_summary(&state.api, room, false).await {
        Ok(summary) => notify(out_tx, ServerEvent::RoomJoined { room: summary }),
        Err(err) => notify(out_tx, ServerEvent::Error(err)),
    }
}

/// Idempotent: leaving a room the connection never joined does nothing.
async fn leave_room(
    state: &Arc<AppState>,
    connection_id: ConnectionId,
    identity: &Identity,
    joined: &Arc<Mutex<HashSet<RoomId>>>,
    room_ref: RoomRef,
) {
    let Ok(RoomResolution::Granted(room)) =
        server_api::resolve_room(&state.api, identity, room_ref).await
    else {
        return;
    };

    if !joined.lock().await.remove(&room.room_id) {
        return;
    }

    state.hub.leave(room.room_id, connection_id).await;
    let remaining = state.hub.subscriber_count(room.room_id).await;
    debug!(connection_id, room_id = room.room_id.0, remaining, "left room");
    if state.presence.on_leave(room.room_id, identity.user_id).await {
        state
            .hub
            .publish(
                room.room_id,
                ServerEvent::UserOffline {
                    room_id: room.room_id,
                    user_id: identity.user_id,
                    last_seen: Utc::now(),
                },
            )
            .await;
    }
}

/// Typing signals are advisory and only valid for rooms this connection has
/// actually joined.
async fn joined_room_id(
    state: &Arc<AppState>,
    identity: &Identity,
    out_tx: &OutboundSender,
    joined: &Arc<Mutex<HashSet<RoomId>>>,
    room_ref: RoomRef,
) -> Option<RoomId> {
    let Ok(RoomResolution::Granted(room)) =
        server_api::resolve_room(&state.api, identity, room_ref).await
    else {
        return None;
    };

    if joined.lock().await.contains(&room.room_id) {
        Some(room.room_id)
    } else {
        notify(
            out_tx,
            ServerEvent::Error(ApiError::new(
                ErrorCode::Forbidden,
                "join the room before sending typing signals",
            )),
        );
        None
    }
}

async fn teardown(
    state: &Arc<AppState>,
    connection_id: ConnectionId,
    identity: &Identity,
    joined: &Arc<Mutex<HashSet<RoomId>>>,
    last_seen_ms: &Arc<AtomicI64>,
) {
    let last_seen = DateTime::from_timestamp_millis(last_seen_ms.load(Ordering::Relaxed))
        .unwrap_or_else(Utc::now);
    let rooms: Vec<RoomId> = joined.lock().await.drain().collect();
    for room_id in rooms {
        state.hub.leave(room_id, connection_id).await;
        state.typing.explicit_stop(room_id, identity.user_id).await;
        let still_online = state.presence.is_online(room_id, identity.user_id).await;
        debug!(
            connection_id,
            room_id = room_id.0,
            still_online,
            "clearing room membership"
        );
        if state.presence.on_leave(room_id, identity.user_id).await {
            state
                .hub
                .publish(
                    room_id,
                    ServerEvent::UserOffline {
                        room_id,
                        user_id: identity.user_id,
                        last_seen,
                    },
                )
                .await;
        }
    }
}

fn notify(out_tx: &OutboundSender, event: ServerEvent) {
    let _ = out_tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build_state, config::Settings};
    use shared::domain::{Role, Tier, UserId};
    use storage::Storage;

    async fn state() -> Arc<AppState> {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        build_state(storage, Settings::default())
    }

    fn ident(user_id: i64, tier: Tier) -> Identity {
        Identity {
            user_id: UserId(user_id),
            display_name: format!("user-{user_id}"),
            role: Role::Student,
            tier,
        }
    }

    #[tokio::test]
    async fn locked_join_reports_the_error_to_that_connection_only() {
        let state = state().await;
        let alice = ident(1, Tier::Beginner);
        let (out_tx, mut out_rx) = state.hub.outbound_channel();
        let joined = Arc::new(Mutex::new(HashSet::new()));

        join_room(
            &state,
            1,
            &alice,
            &out_tx,
            &joined,
            RoomRef::Tier {
                tier: Tier::Advanced,
            },
        )
        .await;

        let event = out_rx.try_recv().expect("error event");
        assert!(matches!(
            event,
            ServerEvent::Error(ApiError {
                code: ErrorCode::LockedForTier,
                ..
            })
        ));
        assert!(joined.lock().await.is_empty(), "no membership recorded");

        let advanced = state
            .api
            .storage
            .get_or_create_tier_room(Tier::Advanced)
            .await
            .expect("room");
        assert_eq!(state.hub.subscriber_count(advanced.room_id).await, 0);
        assert_eq!(state.presence.online_count(advanced.room_id).await, 0);
    }

    #[tokio::test]
    async fn closing_every_connection_emits_a_single_user_offline() {
        let state = state().await;
        let room_ref = RoomRef::Tier {
            tier: Tier::Beginner,
        };

        let observer = ident(2, Tier::Beginner);
        let (observer_tx, mut observer_rx) = state.hub.outbound_channel();
        let observer_joined = Arc::new(Mutex::new(HashSet::new()));
        join_room(&state, 1, &observer, &observer_tx, &observer_joined, room_ref).await;

        let alice = ident(1, Tier::Beginner);
        let mut connections = Vec::new();
        for connection_id in 2..5u64 {
            let (out_tx, _out_rx) = state.hub.outbound_channel();
            let joined = Arc::new(Mutex::new(HashSet::new()));
            join_room(&state, connection_id, &alice, &out_tx, &joined, room_ref).await;
            connections.push((connection_id, joined));
        }

        for (connection_id, joined) in &connections {
            let last_seen = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));
            teardown(&state, *connection_id, &alice, joined, &last_seen).await;
        }

        let mut offline = 0;
        while let Ok(event) = observer_rx.try_recv() {
            if matches!(
                event,
                ServerEvent::UserOffline {
                    user_id: UserId(1),
                    ..
                }
            ) {
                offline += 1;
            }
        }
        assert_eq!(offline, 1, "one offline edge for the whole user");

        let room = state
            .api
            .storage
            .get_or_create_tier_room(Tier::Beginner)
            .await
            .expect("room");
        assert!(!state.presence.is_online(room.room_id, alice.user_id).await);
    }
}
