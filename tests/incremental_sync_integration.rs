mod common;

use std::collections::HashMap;

use mailsync::db::models::JobStatus;
use mailsync::providers::{HistoryMessage, HistoryRecord};
use mailsync::sync::IncrementalOutcome;
use mailsync::watch::PushOutcome;

use common::{provider_message, MockState, TestHarness};

/// Delta fixture: m-new added, m-old deleted, m-flagged label-changed.
fn delta_state() -> MockState {
    let mut messages = HashMap::new();
    messages.insert(
        "m-new".to_string(),
        provider_message("m-new", &["INBOX", "UNREAD"], "Fresh arrival"),
    );
    messages.insert(
        "m-flagged".to_string(),
        provider_message("m-flagged", &["INBOX", "STARRED"], "Now starred"),
    );

    MockState {
        history_id: "2000".to_string(),
        messages,
        history: vec![HistoryRecord {
            messages_added: vec![HistoryMessage {
                id: "m-new".to_string(),
                label_ids: vec!["INBOX".to_string(), "UNREAD".to_string()],
            }],
            messages_deleted: vec!["m-old".to_string()],
            label_changes: vec!["m-flagged".to_string()],
        }],
        ..MockState::default()
    }
}

#[tokio::test]
async fn missing_cursor_requires_full_sync_without_touching_cache() {
    let harness = TestHarness::new(delta_state());
    let mut connection = harness.insert_connection(None);

    let outcome = harness
        .engine
        .run_incremental(&mut connection)
        .await
        .expect("incremental");
    assert_eq!(outcome, IncrementalOutcome::RequiresFullSync);

    assert_eq!(
        harness
            .db
            .count_messages_for_connection(&connection.id)
            .expect("count"),
        0
    );
    let stored = harness
        .db
        .get_connection(&connection.id)
        .expect("get")
        .expect("exists");
    assert!(stored.last_synced_at.is_none());
}

#[tokio::test]
async fn expired_cursor_requires_full_sync() {
    let mut state = delta_state();
    state.invalid_cursor = true;
    let harness = TestHarness::new(state);
    let mut connection = harness.insert_connection(Some("999"));

    let outcome = harness
        .engine
        .run_incremental(&mut connection)
        .await
        .expect("incremental");
    assert_eq!(outcome, IncrementalOutcome::RequiresFullSync);

    let stored = harness
        .db
        .get_connection(&connection.id)
        .expect("get")
        .expect("exists");
    assert_eq!(stored.latest_history_id.as_deref(), Some("999"));
    assert!(stored.last_synced_at.is_none());
    assert!(!stored.sync_in_progress);
}

#[tokio::test]
async fn delta_is_applied_in_disjoint_sets_and_advances_cursor() {
    let harness = TestHarness::new(delta_state());
    let mut connection = harness.insert_connection(Some("1500"));

    // pre-seed the row that the delta deletes
    use mailsync::db::models::{CachedMessage, FolderType};
    harness
        .db
        .upsert_message(&CachedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: connection.user_id.clone(),
            connection_id: connection.id.clone(),
            provider_email_id: "m-old".to_string(),
            folder_id: None,
            subject: Some("Stale".to_string()),
            sender: None,
            recipients: vec![],
            cc: vec![],
            date: None,
            body_html: None,
            body_preview: None,
            read: true,
            starred: false,
            attachments: vec![],
            updated_at: chrono::Utc::now(),
        })
        .expect("seed m-old");

    let outcome = harness
        .engine
        .run_incremental(&mut connection)
        .await
        .expect("incremental");

    let stats = match outcome {
        IncrementalOutcome::Applied(stats) => stats,
        other => panic!("expected applied, got {other:?}"),
    };
    assert_eq!(stats.new_messages, 1);
    assert_eq!(stats.deleted_messages, 1);
    assert_eq!(stats.updated_messages, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.latest_history_id.as_deref(), Some("2000"));

    // m-old gone, m-new and m-flagged cached
    assert!(harness
        .db
        .get_message_by_provider_id(&connection.id, "m-old")
        .expect("query m-old")
        .is_none());
    let fresh = harness
        .db
        .get_message_by_provider_id(&connection.id, "m-new")
        .expect("query m-new")
        .expect("cached");
    let inbox = harness
        .db
        .find_folder_by_type(&connection.id, FolderType::Inbox)
        .expect("find inbox")
        .expect("seeded during incremental");
    assert_eq!(fresh.folder_id.as_deref(), Some(inbox.id.as_str()));
    let starred = harness
        .db
        .get_message_by_provider_id(&connection.id, "m-flagged")
        .expect("query m-flagged")
        .expect("cached");
    assert!(starred.starred);

    let stored = harness
        .db
        .get_connection(&connection.id)
        .expect("get")
        .expect("exists");
    assert_eq!(stored.latest_history_id.as_deref(), Some("2000"));
    assert!(stored.last_synced_at.is_some());
    assert!(!stored.sync_in_progress);
}

#[tokio::test]
async fn replaying_the_same_history_range_is_idempotent() {
    let harness = TestHarness::new(delta_state());
    let mut connection = harness.insert_connection(Some("1500"));

    let first = harness
        .engine
        .run_incremental(&mut connection)
        .await
        .expect("first run");
    assert!(matches!(first, IncrementalOutcome::Applied(_)));
    let count_after_first = harness
        .db
        .count_messages_for_connection(&connection.id)
        .expect("count");

    // force the cursor back and replay the identical delta
    let mut replay_connection = harness
        .db
        .get_connection(&connection.id)
        .expect("get")
        .expect("exists");
    replay_connection.latest_history_id = Some("1500".to_string());
    {
        let raw = rusqlite::Connection::open(&harness.db_path).expect("raw open");
        raw.execute(
            "UPDATE connections SET latest_history_id = '1500' WHERE id = ?",
            [&connection.id],
        )
        .expect("rewind cursor");
    }

    let second = harness
        .engine
        .run_incremental(&mut replay_connection)
        .await
        .expect("replay run");
    let stats = match second {
        IncrementalOutcome::Applied(stats) => stats,
        other => panic!("expected applied, got {other:?}"),
    };
    assert_eq!(stats.new_messages, 1, "adds are upserts");

    // identical store state: same rows, no duplicates
    assert_eq!(
        harness
            .db
            .count_messages_for_connection(&connection.id)
            .expect("count"),
        count_after_first
    );
    let stored = harness
        .db
        .get_connection(&connection.id)
        .expect("get")
        .expect("exists");
    assert_eq!(stored.latest_history_id.as_deref(), Some("2000"));
}

#[tokio::test]
async fn incremental_job_falls_back_to_full_sync_job() {
    let mut state = delta_state();
    state.invalid_cursor = true;
    let harness = TestHarness::new(state);
    let connection = harness.insert_connection(Some("999"));

    let job = harness
        .queue
        .enqueue(
            &connection,
            mailsync::db::models::SyncType::Incremental,
            mailsync::jobs::PRIORITY_SCHEDULED,
        )
        .expect("enqueue incremental");

    let outcome = harness
        .engine
        .run_incremental_job(&job)
        .await
        .expect("run job");
    assert_eq!(outcome, IncrementalOutcome::RequiresFullSync);

    // the incremental job is terminal and a full job took its place
    let finished = harness.queue.get(&job.id).expect("get").expect("row");
    assert_eq!(finished.status, JobStatus::Completed);
    assert!(finished
        .status_message
        .as_deref()
        .is_some_and(|m| m.contains("full sync enqueued")));

    let replacement = harness
        .db
        .find_active_job(&connection.id)
        .expect("active job")
        .expect("full sync pending");
    assert_eq!(
        replacement.sync_type,
        mailsync::db::models::SyncType::Full
    );
}

#[tokio::test]
async fn push_notification_fan_in_applies_once() {
    let harness = TestHarness::new(delta_state());
    let connection = harness.insert_connection(Some("1500"));

    // install the watch so the resource id resolves
    let mut installed = connection.clone();
    harness
        .watches
        .install(&mut installed)
        .await
        .expect("install watch");
    {
        // start the watch cursor behind the provider's head so the first
        // notification has a delta to apply
        let raw = rusqlite::Connection::open(&harness.db_path).expect("raw open");
        raw.execute(
            "UPDATE connections SET watch_history_id = '1500' WHERE id = ?",
            [&connection.id],
        )
        .expect("set watch cursor");
    }

    let first = harness
        .watches
        .handle_notification("watch-res-1", "2000")
        .await
        .expect("first notification");
    assert_eq!(first, PushOutcome::Applied { new_messages: 1 });

    // second delivery for the same underlying change: cursor has caught
    // up, the delta is empty, nothing advances
    let second = harness
        .watches
        .handle_notification("watch-res-1", "2000")
        .await
        .expect("second notification");
    assert_eq!(second, PushOutcome::Applied { new_messages: 0 });

    let stored = harness
        .db
        .get_connection(&connection.id)
        .expect("get")
        .expect("exists");
    assert_eq!(stored.latest_history_id.as_deref(), Some("2000"));
    assert_eq!(stored.watch_history_id.as_deref(), Some("2000"));

    // final cache state equals serial delivery: exactly the one new message
    assert_eq!(
        harness
            .db
            .count_messages_for_connection(&connection.id)
            .expect("count"),
        1
    );
    assert!(harness
        .db
        .get_message_by_provider_id(&connection.id, "m-new")
        .expect("query")
        .is_some());
}

#[tokio::test]
async fn unknown_watch_resource_is_not_found() {
    let harness = TestHarness::new(delta_state());
    harness.insert_connection(Some("1500"));

    let result = harness
        .watches
        .handle_notification("watch-res-unknown", "2000")
        .await;
    assert!(matches!(
        result,
        Err(mailsync::error::SyncError::ConnectionNotFound(_))
    ));
}
