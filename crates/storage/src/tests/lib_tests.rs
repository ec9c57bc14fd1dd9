use super::*;

async fn mem() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = mem().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("engine_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn tier_room_creation_is_idempotent() {
    let storage = mem().await;
    let first = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room");
    let second = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room again");
    assert_eq!(first.room_id, second.room_id);
    assert_eq!(first.kind, RoomKind::Tiered(Tier::Beginner));
    assert_eq!(first.name, "Beginner");
}

#[tokio::test]
async fn direct_room_is_keyed_by_unordered_pair() {
    let storage = mem().await;
    let ab = storage
        .get_or_create_direct_room(UserId(7), UserId(3))
        .await
        .expect("room");
    let ba = storage
        .get_or_create_direct_room(UserId(3), UserId(7))
        .await
        .expect("room again");
    assert_eq!(ab.room_id, ba.room_id);
    assert_eq!(ab.kind, RoomKind::Direct);
    assert_eq!(ab.participants, vec![UserId(3), UserId(7)]);
}

#[tokio::test]
async fn appended_message_shows_up_in_page() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room");
    let message = storage
        .append_message(room.room_id, UserId(1), "alice", MessageKind::Text, Some("hello"), None)
        .await
        .expect("append");
    assert!(message.message_id.0 > 0);

    let page = storage
        .list_room_messages(room.room_id, 10, None)
        .await
        .expect("page");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].message_id, message.message_id);
    assert_eq!(page[0].content.as_deref(), Some("hello"));
}

#[tokio::test]
async fn timestamps_are_strictly_increasing_within_a_room() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Intermediate)
        .await
        .expect("room");

    let mut prev: Option<DateTime<Utc>> = None;
    for i in 0..10 {
        let message = storage
            .append_message(
                room.room_id,
                UserId(1),
                "alice",
                MessageKind::Text,
                Some(format!("m{i}").as_str()),
                None,
            )
            .await
            .expect("append");
        if let Some(prev) = prev {
            assert!(message.created_at > prev, "timestamps must never tie");
        }
        prev = Some(message.created_at);
    }
}

#[tokio::test]
async fn pagination_is_gap_free_and_duplicate_free() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Advanced)
        .await
        .expect("room");
    for i in 0..9 {
        storage
            .append_message(
                room.room_id,
                UserId(1),
                "alice",
                MessageKind::Text,
                Some(format!("m{i}").as_str()),
                None,
            )
            .await
            .expect("append");
    }

    let mut seen = Vec::new();
    let mut before: Option<i64> = None;
    loop {
        let page = storage
            .list_room_messages(room.room_id, 4, before)
            .await
            .expect("page");
        if page.is_empty() {
            break;
        }
        before = Some(page.last().expect("tail").created_at.timestamp_millis());
        seen.extend(page);
    }

    assert_eq!(seen.len(), 9);
    for pair in seen.windows(2) {
        assert!(pair[0].created_at > pair[1].created_at, "descending order");
    }
    let mut ids: Vec<i64> = seen.iter().map(|m| m.message_id.0).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 9, "no duplicates across pages");
}

#[tokio::test]
async fn soft_deleted_message_is_excluded_and_pointer_rolls_back() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room");
    let first = storage
        .append_message(room.room_id, UserId(1), "alice", MessageKind::Text, Some("first"), None)
        .await
        .expect("first");
    let second = storage
        .append_message(room.room_id, UserId(1), "alice", MessageKind::Text, Some("second"), None)
        .await
        .expect("second");

    let fresh = storage
        .room_by_id(room.room_id)
        .await
        .expect("room lookup")
        .expect("room exists");
    assert_eq!(fresh.last_message_id, Some(second.message_id));

    storage
        .soft_delete_message(second.message_id, room.room_id)
        .await
        .expect("delete");

    let page = storage
        .list_room_messages(room.room_id, 10, None)
        .await
        .expect("page");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].message_id, first.message_id);

    let rolled = storage
        .room_by_id(room.room_id)
        .await
        .expect("room lookup")
        .expect("room exists");
    assert_eq!(rolled.last_message_id, Some(first.message_id));
    let last = storage
        .last_visible_message(room.room_id)
        .await
        .expect("last visible");
    assert_eq!(last.expect("survivor").message_id, first.message_id);
}

#[tokio::test]
async fn deleting_the_only_message_clears_the_pointer() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room");
    let only = storage
        .append_message(room.room_id, UserId(1), "alice", MessageKind::Text, Some("only"), None)
        .await
        .expect("append");

    storage
        .soft_delete_message(only.message_id, room.room_id)
        .await
        .expect("delete");

    let fresh = storage
        .room_by_id(room.room_id)
        .await
        .expect("room lookup")
        .expect("room exists");
    assert_eq!(fresh.last_message_id, None);
}

#[tokio::test]
async fn re_adding_the_same_reaction_is_a_no_op() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room");
    let message = storage
        .append_message(room.room_id, UserId(1), "alice", MessageKind::Text, Some("hi"), None)
        .await
        .expect("append");

    storage
        .add_reaction(message.message_id, UserId(2), "👍")
        .await
        .expect("react");
    storage
        .add_reaction(message.message_id, UserId(2), "👍")
        .await
        .expect("react again");
    storage
        .add_reaction(message.message_id, UserId(2), "🎉")
        .await
        .expect("second emoji");

    let reactions = storage
        .list_message_reactions(message.message_id)
        .await
        .expect("reactions");
    assert_eq!(reactions.len(), 2);
}

#[tokio::test]
async fn stores_file_reference_metadata_for_non_text_messages() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room");
    let file = StoredFileRef {
        file_ref: "blob://abc123".into(),
        filename: Some("notes.pdf".into()),
        size_bytes: Some(4096),
    };
    let message = storage
        .append_message(room.room_id, UserId(1), "alice", MessageKind::Document, None, Some(&file))
        .await
        .expect("append");

    let loaded = storage
        .message_by_id(message.message_id)
        .await
        .expect("lookup")
        .expect("exists");
    let loaded_file = loaded.file.expect("file ref");
    assert_eq!(loaded_file.file_ref, "blob://abc123");
    assert_eq!(loaded_file.filename.as_deref(), Some("notes.pdf"));
    assert_eq!(loaded_file.size_bytes, Some(4096));
}

#[tokio::test]
async fn read_cursor_upsert_overwrites() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room");
    let message = storage
        .append_message(room.room_id, UserId(1), "alice", MessageKind::Text, Some("hi"), None)
        .await
        .expect("append");

    storage
        .upsert_read_cursor(room.room_id, UserId(2), None)
        .await
        .expect("cursor");
    storage
        .upsert_read_cursor(room.room_id, UserId(2), Some(message.message_id))
        .await
        .expect("cursor update");

    let cursor = storage
        .read_cursor(room.room_id, UserId(2))
        .await
        .expect("lookup")
        .expect("row exists");
    assert_eq!(cursor, Some(message.message_id));
}

#[tokio::test]
async fn append_advances_the_last_message_pointer_with_the_row() {
    let storage = mem().await;
    let room = storage
        .get_or_create_tier_room(Tier::Beginner)
        .await
        .expect("room");
    assert_eq!(room.last_message_id, None);

    for i in 0..3 {
        let message = storage
            .append_message(
                room.room_id,
                UserId(1),
                "alice",
                MessageKind::Text,
                Some(format!("m{i}").as_str()),
                None,
            )
            .await
            .expect("append");
        let fresh = storage
            .room_by_id(room.room_id)
            .await
            .expect("lookup")
            .expect("room exists");
        assert_eq!(fresh.last_message_id, Some(message.message_id));
    }
}
