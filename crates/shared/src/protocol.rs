use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageKind, RoomId, Tier, UserId},
    error::ApiError,
};

/// How a client names a room before it knows the canonical id. Every variant
/// resolves to a persisted room id before any write; there is no placeholder
/// identity at this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoomRef {
    Id { room_id: RoomId },
    Tier { tier: Tier },
    Direct { peer_id: UserId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinRoom { room: RoomRef },
    LeaveRoom { room: RoomRef },
    Typing { room: RoomRef },
    StopTyping { room: RoomRef },
    Online {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<UserId>,
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRefPayload {
    pub file_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRefPayload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<ReactionPayload>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessagePayload>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomJoined {
        room: RoomSummary,
    },
    Message {
        message: MessagePayload,
    },
    MessageDeleted {
        message_id: MessageId,
        room_id: RoomId,
    },
    Reaction {
        reaction: ReactionPayload,
    },
    Typing {
        room_id: RoomId,
        user_id: UserId,
    },
    StopTyping {
        room_id: RoomId,
        user_id: UserId,
    },
    UserOnline {
        room_id: RoomId,
        user_id: UserId,
    },
    UserOffline {
        room_id: RoomId,
        user_id: UserId,
        last_seen: DateTime<Utc>,
    },
    Error(ApiError),
}
