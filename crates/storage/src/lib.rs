use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{MessageId, MessageKind, RoomId, RoomKind, Tier, UserId};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredRoom {
    pub room_id: RoomId,
    pub name: String,
    pub kind: RoomKind,
    pub participants: Vec<UserId>,
    pub last_message_id: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file: Option<StoredFileRef>,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct StoredFileRef {
    pub file_ref: String,
    pub filename: Option<String>,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StoredReaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Idempotent: the partial unique index on `kind` guarantees exactly one
    /// room per tier label, so a lost insert race still resolves to the
    /// canonical row.
    pub async fn get_or_create_tier_room(&self, tier: Tier) -> Result<StoredRoom> {
        sqlx::query("INSERT INTO rooms (name, kind, created_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING")
            .bind(tier.display_name())
            .bind(tier.as_str())
            .bind(now_ms())
            .execute(&self.pool)
            .await?;

        let row = sqlx::query(
            "SELECT id, name, kind, user_lo, user_hi, last_message_id, created_at
             FROM rooms WHERE kind = ?",
        )
        .bind(tier.as_str())
        .fetch_one(&self.pool)
        .await?;
        read_room_row(&row)
    }

    /// Direct rooms are keyed by the unordered participant pair.
    pub async fn get_or_create_direct_room(&self, a: UserId, b: UserId) -> Result<StoredRoom> {
        let (lo, hi) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
        sqlx::query(
            "INSERT INTO rooms (name, kind, user_lo, user_hi, created_at)
             VALUES (?, 'direct', ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(format!("dm:{lo}:{hi}"))
        .bind(lo)
        .bind(hi)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT id, name, kind, user_lo, user_hi, last_message_id, created_at
             FROM rooms WHERE kind = 'direct' AND user_lo = ? AND user_hi = ?",
        )
        .bind(lo)
        .bind(hi)
        .fetch_one(&self.pool)
        .await?;
        read_room_row(&row)
    }

    pub async fn room_by_id(&self, room_id: RoomId) -> Result<Option<StoredRoom>> {
        let row = sqlx::query(
            "SELECT id, name, kind, user_lo, user_hi, last_message_id, created_at
             FROM rooms WHERE id = ?",
        )
        .bind(room_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| read_room_row(&r)).transpose()
    }

    pub async fn list_direct_rooms_for(&self, user_id: UserId) -> Result<Vec<StoredRoom>> {
        let rows = sqlx::query(
            "SELECT id, name, kind, user_lo, user_hi, last_message_id, created_at
             FROM rooms WHERE kind = 'direct' AND (user_lo = ? OR user_hi = ?)
             ORDER BY id ASC",
        )
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(read_room_row).collect()
    }

    /// Appends a message with a strictly monotonic per-room timestamp
    /// (`max(now, prev + 1)` milliseconds) and advances the room's
    /// last-message pointer. Callers serialize appends per room, so publish
    /// order matches this timestamp order.
    pub async fn append_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        sender_name: &str,
        kind: MessageKind,
        content: Option<&str>,
        file: Option<&StoredFileRef>,
    ) -> Result<StoredMessage> {
        // Timestamp assignment happens inside the INSERT itself so the
        // read-compute-write is a single atomic statement; the pointer
        // advance commits with it.
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (room_id, sender_user_id, sender_name, kind, content, file_ref, file_name, file_size_bytes, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?,
                     MAX(?, COALESCE((SELECT MAX(created_at) + 1 FROM messages WHERE room_id = ?), 0)))
             RETURNING id, created_at",
        )
        .bind(room_id.0)
        .bind(sender_id.0)
        .bind(sender_name)
        .bind(kind.as_str())
        .bind(content)
        .bind(file.map(|f| f.file_ref.as_str()))
        .bind(file.and_then(|f| f.filename.as_deref()))
        .bind(file.and_then(|f| f.size_bytes.map(|s| i64::try_from(s).unwrap_or(i64::MAX))))
        .bind(now_ms())
        .bind(room_id.0)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.get::<i64, _>(0));
        let created_at = rec.get::<i64, _>(1);

        sqlx::query("UPDATE rooms SET last_message_id = ? WHERE id = ?")
            .bind(message_id.0)
            .bind(room_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(StoredMessage {
            message_id,
            room_id,
            sender_id,
            sender_name: sender_name.to_string(),
            kind,
            content: content.map(str::to_string),
            file: file.cloned(),
            created_at: dt(created_at),
            deleted: false,
        })
    }

    /// Newest-first page of visible messages with `created_at < before_ms`.
    pub async fn list_room_messages(
        &self,
        room_id: RoomId,
        limit: u32,
        before_ms: Option<i64>,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some(before_ms) = before_ms {
            sqlx::query(
                "SELECT id, room_id, sender_user_id, sender_name, kind, content, file_ref, file_name, file_size_bytes, created_at, deleted
                 FROM messages
                 WHERE room_id = ? AND deleted = 0 AND created_at < ?
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?",
            )
            .bind(room_id.0)
            .bind(before_ms)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(
                "SELECT id, room_id, sender_user_id, sender_name, kind, content, file_ref, file_name, file_size_bytes, created_at, deleted
                 FROM messages
                 WHERE room_id = ? AND deleted = 0
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?",
            )
            .bind(room_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(read_message_row).collect()
    }

    pub async fn message_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT id, room_id, sender_user_id, sender_name, kind, content, file_ref, file_name, file_size_bytes, created_at, deleted
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| read_message_row(&r)).transpose()
    }

    /// Append-only; re-adding the same emoji is a no-op thanks to the unique
    /// (message, user, emoji) index.
    pub async fn add_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<StoredReaction> {
        sqlx::query(
            "INSERT INTO reactions (message_id, user_id, emoji, created_at)
             VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        let created_at: i64 = sqlx::query_scalar(
            "SELECT created_at FROM reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .fetch_one(&self.pool)
        .await?;

        Ok(StoredReaction {
            message_id,
            user_id,
            emoji: emoji.to_string(),
            created_at: dt(created_at),
        })
    }

    pub async fn list_message_reactions(&self, message_id: MessageId) -> Result<Vec<StoredReaction>> {
        let rows = sqlx::query(
            "SELECT message_id, user_id, emoji, created_at FROM reactions
             WHERE message_id = ? ORDER BY id ASC",
        )
        .bind(message_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredReaction {
                message_id: MessageId(r.get::<i64, _>(0)),
                user_id: UserId(r.get::<i64, _>(1)),
                emoji: r.get::<String, _>(2),
                created_at: dt(r.get::<i64, _>(3)),
            })
            .collect())
    }

    /// Flags the message deleted and, when it was the room's last-message
    /// pointer, rolls the pointer back to the newest surviving message.
    pub async fn soft_delete_message(&self, message_id: MessageId, room_id: RoomId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE messages SET deleted = 1 WHERE id = ?")
            .bind(message_id.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE rooms SET last_message_id = (
                 SELECT id FROM messages
                 WHERE room_id = rooms.id AND deleted = 0
                 ORDER BY created_at DESC, id DESC LIMIT 1
             )
             WHERE id = ? AND last_message_id = ?",
        )
        .bind(room_id.0)
        .bind(message_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn last_visible_message(&self, room_id: RoomId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(
            "SELECT m.id, m.room_id, m.sender_user_id, m.sender_name, m.kind, m.content, m.file_ref, m.file_name, m.file_size_bytes, m.created_at, m.deleted
             FROM rooms r
             INNER JOIN messages m ON m.id = r.last_message_id
             WHERE r.id = ? AND m.deleted = 0",
        )
        .bind(room_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| read_message_row(&r)).transpose()
    }

    pub async fn upsert_read_cursor(
        &self,
        room_id: RoomId,
        user_id: UserId,
        last_read: Option<MessageId>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_cursors (room_id, user_id, last_read_message_id, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (room_id, user_id) DO UPDATE SET
                 last_read_message_id = excluded.last_read_message_id,
                 updated_at = excluded.updated_at",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .bind(last_read.map(|m| m.0))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_cursor(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<Option<MessageId>>> {
        let row = sqlx::query(
            "SELECT last_read_message_id FROM read_cursors WHERE room_id = ? AND user_id = ?",
        )
        .bind(room_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<Option<i64>, _>(0).map(MessageId)))
    }
}

fn read_room_row(row: &SqliteRow) -> Result<StoredRoom> {
    let kind_raw = row.get::<String, _>(2);
    let (kind, participants) = if kind_raw == "direct" {
        let lo = row.get::<Option<i64>, _>(3);
        let hi = row.get::<Option<i64>, _>(4);
        let participants = lo
            .into_iter()
            .chain(hi)
            .map(UserId)
            .collect::<Vec<_>>();
        (RoomKind::Direct, participants)
    } else {
        let tier = Tier::parse(&kind_raw)
            .with_context(|| format!("unknown room kind '{kind_raw}'"))?;
        (RoomKind::Tiered(tier), Vec::new())
    };

    Ok(StoredRoom {
        room_id: RoomId(row.get::<i64, _>(0)),
        name: row.get::<String, _>(1),
        kind,
        participants,
        last_message_id: row.get::<Option<i64>, _>(5).map(MessageId),
        created_at: dt(row.get::<i64, _>(6)),
    })
}

fn read_message_row(row: &SqliteRow) -> Result<StoredMessage> {
    let kind_raw = row.get::<String, _>(4);
    let kind = MessageKind::parse(&kind_raw)
        .with_context(|| format!("unknown message kind '{kind_raw}'"))?;

    Ok(StoredMessage {
        message_id: MessageId(row.get::<i64, _>(0)),
        room_id: RoomId(row.get::<i64, _>(1)),
        sender_id: UserId(row.get::<i64, _>(2)),
        sender_name: row.get::<String, _>(3),
        kind,
        content: row.get::<Option<String>, _>(5),
        file: row.get::<Option<String>, _>(6).map(|file_ref| StoredFileRef {
            file_ref,
            filename: row.get::<Option<String>, _>(7),
            size_bytes: row.get::<Option<i64>, _>(8).map(|s| s.max(0) as u64),
        }),
        created_at: dt(row.get::<i64, _>(9)),
        deleted: row.get::<bool, _>(10),
    })
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
