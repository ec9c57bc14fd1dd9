use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{ApiContext, DEFAULT_PAGE_LIMIT};
use shared::{
    domain::{Identity, MessageId, MessageKind, RoomId},
    error::{ApiError, ErrorCode},
    protocol::{FileRefPayload, MessagePage, MessagePayload, RoomRef, RoomSummary, ServerEvent},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod auth;
mod config;
mod gateway;
mod hub;
mod presence;
mod typing;

use auth::{verify_identity_token, AuthConfig};
use config::{load_settings, prepare_database_url, Settings};
use hub::RoomHub;
use presence::PresenceTracker;
use typing::TypingCoordinator;

pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: Arc<RoomHub>,
    pub(crate) presence: Arc<PresenceTracker>,
    pub(crate) typing: Arc<TypingCoordinator>,
    pub(crate) auth: AuthConfig,
    pub(crate) settings: Settings,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    room: RoomRef,
    kind: MessageKind,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    file: Option<FileRefPayload>,
}

#[derive(Debug, Deserialize)]
struct ReactionRequest {
    emoji: String,
}

const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = build_state(storage, settings.clone());
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "messaging engine listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(storage: Storage, settings: Settings) -> Arc<AppState> {
    let hub = Arc::new(RoomHub::new(settings.outbound_queue_capacity));
    let presence = Arc::new(PresenceTracker::new());
    let typing = Arc::new(TypingCoordinator::new(
        hub.clone(),
        Duration::from_millis(settings.typing_ttl_ms),
    ));
    let auth = AuthConfig {
        secret: settings.auth_secret.clone(),
        ttl_seconds: settings.auth_ttl_seconds,
    };
    Arc::new(AppState {
        api: ApiContext { storage },
        hub,
        presence,
        typing,
        auth,
        settings,
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/rooms", get(http_list_rooms))
        .route("/rooms/:room_id/messages", get(http_list_messages))
        .route("/rooms/:room_id/read", post(http_mark_read))
        .route("/messages", post(http_send_message))
        .route("/messages/:message_id", delete(http_delete_message))
        .route("/messages/:message_id/reactions", post(http_add_reaction))
        .route("/dev/token", post(http_dev_token))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    // Bad identity refuses the channel before the upgrade completes.
    match verify_identity_token(&state.auth, &q.token) {
        Ok(identity) => ws
            .on_upgrade(move |socket| gateway::ws_connection(state, socket, identity))
            .into_response(),
        Err(err) => reject(err).into_response(),
    }
}

async fn http_list_rooms(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<RoomSummary>>, (StatusCode, Json<ApiError>)> {
    let identity = bearer_identity(&state, &headers)?;
    let rooms = server_api::list_rooms(&state.api, &identity)
        .await
        .map_err(reject)?;
    Ok(Json(rooms))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
    headers: HeaderMap,
) -> Result<Json<MessagePage>, (StatusCode, Json<ApiError>)> {
    let identity = bearer_identity(&state, &headers)?;
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let page = server_api::page_messages(&state.api, &identity, RoomId(room_id), limit, q.before)
        .await
        .map_err(reject)?;
    Ok(Json(page))
}

/// The synchronous write path. The room's append lock is held from persist
/// through publish so every viewer observes messages in storage order, and
/// the sender's other connections receive the same canonical broadcast copy
/// (clients dedup by message id).
async fn http_send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let identity = bearer_identity(&state, &headers)?;
    let room = server_api::resolve_room(&state.api, &identity, req.room)
        .await
        .map_err(reject)?
        .granted()
        .map_err(reject)?;

    let topic = state.hub.topic(room.room_id).await;
    let _append_guard = topic.append_lock.lock().await;

    let message = server_api::post_message(
        &state.api,
        &identity,
        RoomRef::Id {
            room_id: room.room_id,
        },
        req.kind,
        req.content,
        req.file,
    )
    .await
    .map_err(reject)?;

    state
        .hub
        .publish(
            room.room_id,
            ServerEvent::Message {
                message: message.clone(),
            },
        )
        .await;

    Ok(Json(message))
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let identity = bearer_identity(&state, &headers)?;
    let room_id = server_api::message_room(&state.api, MessageId(message_id))
        .await
        .map_err(reject)?;

    // Lock before the mutation so publish order matches persistence order.
    let topic = state.hub.topic(room_id).await;
    let _append_guard = topic.append_lock.lock().await;

    let (message_id, room_id) =
        server_api::delete_message(&state.api, &identity, MessageId(message_id))
            .await
            .map_err(reject)?;
    state
        .hub
        .publish(room_id, ServerEvent::MessageDeleted { message_id, room_id })
        .await;

    Ok(StatusCode::NO_CONTENT)
}

async fn http_add_reaction(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    headers: HeaderMap,
    Json(req): Json<ReactionRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let identity = bearer_identity(&state, &headers)?;
    let room_id = server_api::message_room(&state.api, MessageId(message_id))
        .await
        .map_err(reject)?;

    let topic = state.hub.topic(room_id).await;
    let _append_guard = topic.append_lock.lock().await;

    let reaction = server_api::add_reaction(&state.api, &identity, MessageId(message_id), &req.emoji)
        .await
        .map_err(reject)?;
    state
        .hub
        .publish(room_id, ServerEvent::Reaction { reaction })
        .await;

    Ok(StatusCode::NO_CONTENT)
}

/// Local-dev stand-in for the external identity collaborator; real
/// deployments mint tokens elsewhere with the shared secret.
async fn http_dev_token(
    State(state): State<Arc<AppState>>,
    Json(identity): Json<Identity>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<ApiError>)> {
    let token = auth::mint_identity_token(&state.auth, &identity).map_err(|e| {
        reject(ApiError::new(
            ErrorCode::Internal,
            format!("token mint failed: {e}"),
        ))
    })?;
    Ok(Json(serde_json::json!({ "token": token })))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let identity = bearer_identity(&state, &headers)?;
    server_api::mark_read(&state.api, &identity, RoomId(room_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

fn bearer_identity(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer token",
            ))
        })?;
    verify_identity_token(&state.auth, token).map_err(reject)
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden | ErrorCode::LockedForTier => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Transient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}
