use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(MessageId);

/// Ordinal access level gating the tiered rooms. Derived `Ord` gives
/// beginner < intermediate < advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Beginner,
    Intermediate,
    Advanced,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Beginner, Tier::Intermediate, Tier::Advanced];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Beginner => "beginner",
            Tier::Intermediate => "intermediate",
            Tier::Advanced => "advanced",
        }
    }

    pub fn parse(value: &str) -> Option<Tier> {
        match value {
            "beginner" => Some(Tier::Beginner),
            "intermediate" => Some(Tier::Intermediate),
            "advanced" => Some(Tier::Advanced),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Tier::Beginner => "Beginner",
            Tier::Intermediate => "Intermediate",
            Tier::Advanced => "Advanced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

impl Role {
    /// Instructors and admins read/write every tiered room and may delete
    /// any message.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Instructor | Role::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Tiered(Tier),
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Document,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Option<MessageKind> {
        match value {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "audio" => Some(MessageKind::Audio),
            "document" => Some(MessageKind::Document),
            _ => None,
        }
    }
}

/// Outcome of resolving a room for a user. `LockedForTier` is signaled back
/// to the caller, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDecision {
    Allowed,
    LockedForTier,
    NotFound,
}

/// The trusted tuple supplied by the identity collaborator for a connecting
/// principal. Trusted for the lifetime of a connection or request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub tier: Tier,
}

impl Identity {
    /// Tier-gate check for a tiered room: allowed iff the room's tier is at
    /// or below the user's unlocked tier, or the role bypasses the gate.
    pub fn unlocks(&self, room_tier: Tier) -> bool {
        self.role.is_privileged() || room_tier <= self.tier
    }
}
