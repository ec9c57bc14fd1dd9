use shared::{
    domain::{AccessDecision, Identity, MessageId, MessageKind, RoomId, RoomKind, Tier},
    error::{ApiError, ErrorCode},
    protocol::{
        FileRefPayload, MessagePage, MessagePayload, ReactionPayload, RoomRef, RoomSummary,
    },
};
use storage::{Storage, StoredFileRef, StoredMessage, StoredRoom};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Result of resolving a room reference for a user. Locked rooms are still
/// resolved (the caller may render them as disabled); only writes and joins
/// require `granted`.
#[derive(Debug, Clone)]
pub enum RoomResolution {
    Granted(StoredRoom),
    Locked(StoredRoom),
    NotFound,
}

impl RoomResolution {
    pub fn decision(&self) -> AccessDecision {
        match self {
            RoomResolution::Granted(_) => AccessDecision::Allowed,
            RoomResolution::Locked(_) => AccessDecision::LockedForTier,
            RoomResolution::NotFound => AccessDecision::NotFound,
        }
    }

    pub fn granted(self) -> Result<StoredRoom, ApiError> {
        match self {
            RoomResolution::Granted(room) => Ok(room),
            RoomResolution::Locked(room) => Err(ApiError::new(
                ErrorCode::LockedForTier,
                format!("room '{}' is locked until you reach its level", room.name),
            )),
            RoomResolution::NotFound => Err(ApiError::new(ErrorCode::NotFound, "room not found")),
        }
    }
}

/// Resolves any room reference to a canonical persisted room plus an access
/// decision. Tier and direct references are created lazily and idempotently,
/// so no placeholder identity ever exists at this boundary.
pub async fn resolve_room(
    ctx: &ApiContext,
    identity: &Identity,
    room_ref: RoomRef,
) -> Result<RoomResolution, ApiError> {
    match room_ref {
        RoomRef::Tier { tier } => {
            let room = ctx
                .storage
                .get_or_create_tier_room(tier)
                .await
                .map_err(store_unavailable)?;
            Ok(gate_tiered(identity, room, tier))
        }
        RoomRef::Direct { peer_id } => {
            let room = ctx
                .storage
                .get_or_create_direct_room(identity.user_id, peer_id)
                .await
                .map_err(store_unavailable)?;
            Ok(RoomResolution::Granted(room))
        }
        RoomRef::Id { room_id } => {
            let Some(room) = ctx
                .storage
                .room_by_id(room_id)
                .await
                .map_err(store_unavailable)?
            else {
                return Ok(RoomResolution::NotFound);
            };
            match room.kind {
                RoomKind::Tiered(tier) => Ok(gate_tiered(identity, room, tier)),
                RoomKind::Direct => {
                    // Non-participants are told nothing about the room.
                    if room.participants.contains(&identity.user_id) {
                        Ok(RoomResolution::Granted(room))
                    } else {
                        Ok(RoomResolution::NotFound)
                    }
                }
            }
        }
    }
}

fn gate_tiered(identity: &Identity, room: StoredRoom, tier: Tier) -> RoomResolution {
    if identity.unlocks(tier) {
        RoomResolution::Granted(room)
    } else {
        RoomResolution::Locked(room)
    }
}

/// All tiered rooms annotated with a `locked` flag (locked rooms are listed,
/// not hidden) plus the user's direct rooms.
pub async fn list_rooms(ctx: &ApiContext, identity: &Identity) -> Result<Vec<RoomSummary>, ApiError> {
    let mut summaries = Vec::with_capacity(Tier::ALL.len());
    for tier in Tier::ALL {
        let room = ctx
            .storage
            .get_or_create_tier_room(tier)
            .await
            .map_err(store_unavailable)?;
        let locked = !identity.unlocks(tier);
        summaries.push(room_summary(ctx, room, locked).await?);
    }

    let direct = ctx
        .storage
        .list_direct_rooms_for(identity.user_id)
        .await
        .map_err(store_unavailable)?;
    for room in direct {
        summaries.push(room_summary(ctx, room, false).await?);
    }

    Ok(summaries)
}

pub async fn room_summary(
    ctx: &ApiContext,
    room: StoredRoom,
    locked: bool,
) -> Result<RoomSummary, ApiError> {
    let last_message = ctx
        .storage
        .last_visible_message(room.room_id)
        .await
        .map_err(store_unavailable)?
        .map(|m| message_payload(m, Vec::new()));

    let tier = match room.kind {
        RoomKind::Tiered(tier) => Some(tier),
        RoomKind::Direct => None,
    };

    Ok(RoomSummary {
        room_id: room.room_id,
        name: room.name,
        tier,
        participants: room.participants,
        locked,
        last_message,
    })
}

/// Newest-first page of a room's visible history. `has_more` is a heuristic:
/// a full page means "maybe more", so callers re-query with the oldest
/// timestamp of the page.
pub async fn page_messages(
    ctx: &ApiContext,
    identity: &Identity,
    room_id: RoomId,
    limit: u32,
    before_ms: Option<i64>,
) -> Result<MessagePage, ApiError> {
    resolve_room(ctx, identity, RoomRef::Id { room_id })
        .await?
        .granted()?;

    let limit = limit.clamp(1, MAX_PAGE_LIMIT);
    let messages = ctx
        .storage
        .list_room_messages(room_id, limit, before_ms)
        .await
        .map_err(store_unavailable)?;
    let has_more = messages.len() == limit as usize;

    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let reactions = ctx
            .storage
            .list_message_reactions(message.message_id)
            .await
            .map_err(store_unavailable)?;
        let room_id = message.room_id;
        let reactions = reactions
            .into_iter()
            .map(|r| ReactionPayload {
                message_id: r.message_id,
                room_id,
                user_id: r.user_id,
                emoji: r.emoji,
            })
            .collect();
        payloads.push(message_payload(message, reactions));
    }

    Ok(MessagePage {
        messages: payloads,
        has_more,
    })
}

/// The synchronous write path: validate, persist, and return the canonical
/// message (server-assigned id and timestamp) for broadcast. Nothing is
/// persisted when validation fails.
pub async fn post_message(
    ctx: &ApiContext,
    identity: &Identity,
    room_ref: RoomRef,
    kind: MessageKind,
    content: Option<String>,
    file: Option<FileRefPayload>,
) -> Result<MessagePayload, ApiError> {
    let room = resolve_room(ctx, identity, room_ref).await?.granted()?;

    let content = content
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty());
    let file = file.map(|f| StoredFileRef {
        file_ref: f.file_ref,
        filename: f.filename,
        size_bytes: f.size_bytes,
    });

    match kind {
        MessageKind::Text => {
            if content.is_none() {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    "text message content cannot be empty",
                ));
            }
        }
        _ => {
            if file.is_none() {
                return Err(ApiError::new(
                    ErrorCode::Validation,
                    format!("{} message requires a file reference", kind.as_str()),
                ));
            }
        }
    }

    let message = ctx
        .storage
        .append_message(
            room.room_id,
            identity.user_id,
            &identity.display_name,
            kind,
            content,
            file.as_ref(),
        )
        .await
        .map_err(store_unavailable)?;

    Ok(message_payload(message, Vec::new()))
}

/// Append-only reaction on a visible message the user can read.
pub async fn add_reaction(
    ctx: &ApiContext,
    identity: &Identity,
    message_id: MessageId,
    emoji: &str,
) -> Result<ReactionPayload, ApiError> {
    let emoji = emoji.trim();
    if emoji.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "emoji cannot be empty"));
    }

    let message = visible_message(ctx, message_id).await?;
    resolve_room(
        ctx,
        identity,
        RoomRef::Id {
            room_id: message.room_id,
        },
    )
    .await?
    .granted()?;

    let reaction = ctx
        .storage
        .add_reaction(message_id, identity.user_id, emoji)
        .await
        .map_err(store_unavailable)?;

    Ok(ReactionPayload {
        message_id: reaction.message_id,
        room_id: message.room_id,
        user_id: reaction.user_id,
        emoji: reaction.emoji,
    })
}

/// Soft delete by the sender or a privileged role. Returns the room so the
/// caller can propagate the deletion to its viewers.
pub async fn delete_message(
    ctx: &ApiContext,
    identity: &Identity,
    message_id: MessageId,
) -> Result<(MessageId, RoomId), ApiError> {
    let message = visible_message(ctx, message_id).await?;
    if message.sender_id != identity.user_id && !identity.role.is_privileged() {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender or an instructor may delete a message",
        ));
    }

    ctx.storage
        .soft_delete_message(message_id, message.room_id)
        .await
        .map_err(store_unavailable)?;

    Ok((message_id, message.room_id))
}

/// Moves the caller's read cursor to the room's newest message.
pub async fn mark_read(
    ctx: &ApiContext,
    identity: &Identity,
    room_id: RoomId,
) -> Result<(), ApiError> {
    let room = resolve_room(ctx, identity, RoomRef::Id { room_id })
        .await?
        .granted()?;

    ctx.storage
        .upsert_read_cursor(room.room_id, identity.user_id, room.last_message_id)
        .await
        .map_err(store_unavailable)?;
    Ok(())
}

/// Room of a visible message, for callers that serialize on the room before
/// mutating it.
pub async fn message_room(ctx: &ApiContext, message_id: MessageId) -> Result<RoomId, ApiError> {
    Ok(visible_message(ctx, message_id).await?.room_id)
}

async fn visible_message(ctx: &ApiContext, message_id: MessageId) -> Result<StoredMessage, ApiError> {
    let message = ctx
        .storage
        .message_by_id(message_id)
        .await
        .map_err(store_unavailable)?;
    match message {
        Some(message) if !message.deleted => Ok(message),
        // Deleted messages are excluded from reads and from mutation alike.
        _ => Err(ApiError::new(ErrorCode::NotFound, "message not found")),
    }
}

pub fn message_payload(message: StoredMessage, reactions: Vec<ReactionPayload>) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        room_id: message.room_id,
        sender_id: message.sender_id,
        sender_name: message.sender_name,
        kind: message.kind,
        content: message.content,
        file: message.file.map(|f| FileRefPayload {
            file_ref: f.file_ref,
            filename: f.filename,
            size_bytes: f.size_bytes,
        }),
        reactions,
        created_at: message.created_at,
    }
}

fn store_unavailable(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Transient, err.to_string())
}
