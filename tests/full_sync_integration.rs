mod common;

use std::collections::HashMap;

use chrono::{Duration, Utc};
use mailsync::db::models::{fmt_ts, JobStatus, SyncStatus, SyncType};
use mailsync::error::SyncError;
use mailsync::jobs::PRIORITY_USER;
use mailsync::worker::{Worker, WorkerConfig};

use common::{provider_message, MockState, RefreshBehavior, TestHarness};

fn three_message_mailbox() -> MockState {
    let mut folder_messages = HashMap::new();
    folder_messages.insert(
        "INBOX".to_string(),
        vec!["m-1".to_string(), "m-2".to_string()],
    );
    folder_messages.insert("SENT".to_string(), vec!["m-3".to_string()]);
    folder_messages.insert("DRAFT".to_string(), vec![]);
    folder_messages.insert("TRASH".to_string(), vec![]);

    let mut messages = HashMap::new();
    messages.insert(
        "m-1".to_string(),
        provider_message("m-1", &["INBOX", "UNREAD"], "First"),
    );
    messages.insert(
        "m-2".to_string(),
        provider_message("m-2", &["INBOX"], "Second"),
    );
    messages.insert("m-3".to_string(), provider_message("m-3", &["SENT"], "Third"));

    MockState {
        history_id: "1000".to_string(),
        folder_messages,
        messages,
        ..MockState::default()
    }
}

#[tokio::test]
async fn happy_full_sync_rebuilds_every_folder() {
    let harness = TestHarness::new(three_message_mailbox());
    let connection = harness.insert_connection(None);

    let job = harness
        .queue
        .enqueue(&connection, SyncType::Full, PRIORITY_USER)
        .expect("enqueue full sync");

    let stats = harness.engine.run_full(&job).await.expect("full sync");
    assert_eq!(stats.messages_synced, 3);
    assert_eq!(stats.folders_completed, 4);
    assert_eq!(stats.folders_failed, 0);
    assert_eq!(stats.latest_history_id.as_deref(), Some("1000"));

    let job = harness.queue.get(&job.id).expect("get job").expect("job row");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.folders_completed, 4);
    assert_eq!(job.total_folders, 4);
    assert_eq!(job.messages_synced, 3);
    assert_eq!(job.latest_history_id.as_deref(), Some("1000"));
    assert!(job.completed_at.is_some());

    assert_eq!(
        harness
            .db
            .count_messages_for_connection(&connection.id)
            .expect("count"),
        3
    );

    let connection = harness
        .db
        .get_connection(&connection.id)
        .expect("get connection")
        .expect("exists");
    assert_eq!(connection.latest_history_id.as_deref(), Some("1000"));
    assert_eq!(connection.sync_status, SyncStatus::Idle);
    assert!(connection.sync_enabled);
    assert!(!connection.sync_in_progress);
    assert!(connection.last_synced_at.is_some());
    assert!(connection.sync_error.is_none());

    // the cached inbox rows landed in the inbox folder
    let inbox = harness
        .db
        .find_folder_by_type(&connection.id, mailsync::db::models::FolderType::Inbox)
        .expect("find inbox")
        .expect("inbox seeded");
    let m1 = harness
        .db
        .get_message_by_provider_id(&connection.id, "m-1")
        .expect("get m-1")
        .expect("cached");
    assert_eq!(m1.folder_id.as_deref(), Some(inbox.id.as_str()));
    assert!(!m1.read);
}

#[tokio::test]
async fn revoked_token_fails_job_and_flags_connection() {
    let mut state = three_message_mailbox();
    state.refresh_behavior = RefreshBehavior::Revoked;
    let harness = TestHarness::new(state);
    let connection = harness.insert_connection(None);

    harness
        .queue
        .enqueue(&connection, SyncType::Full, PRIORITY_USER)
        .expect("enqueue full sync");

    let mut worker = Worker::new(
        harness.db.clone(),
        harness.queue.clone(),
        harness.engine.clone(),
        WorkerConfig::default(),
    );
    worker.register().expect("register");
    let processed = worker.poll_once().await.expect("poll");
    assert_eq!(processed, 1);

    let job = harness
        .db
        .find_active_job(&connection.id)
        .expect("query active");
    assert!(job.is_none(), "no job left in progress");

    let jobs = harness
        .queue
        .recent_for_user("user-1", 5)
        .expect("recent jobs");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0]
        .status_message
        .as_deref()
        .is_some_and(|m| m.contains("revoked")));

    let connection = harness
        .db
        .get_connection(&connection.id)
        .expect("get connection")
        .expect("exists");
    assert_eq!(connection.sync_status, SyncStatus::RequiresReauth);
    assert!(!connection.sync_in_progress);

    // no cache writes happened before the refusal
    assert_eq!(
        harness
            .db
            .count_messages_for_connection(&connection.id)
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn crashed_worker_job_is_reclaimed_and_converges() {
    let harness = TestHarness::new(three_message_mailbox());
    let connection = harness.insert_connection(None);

    let job = harness
        .queue
        .enqueue(&connection, SyncType::Full, PRIORITY_USER)
        .expect("enqueue");

    // worker A claims, writes nothing more, and dies
    let claimed = harness.queue.claim_next("worker-a", 1).expect("claim");
    assert_eq!(claimed.len(), 1);

    {
        let raw = rusqlite::Connection::open(&harness.db_path).expect("raw open");
        raw.execute(
            "UPDATE sync_jobs SET updated_at = ? WHERE id = ?",
            rusqlite::params![fmt_ts(Utc::now() - Duration::minutes(20)), job.id],
        )
        .expect("age job past lock timeout");
    }

    let reclaimed = harness
        .queue
        .reclaim_abandoned("worker-b", Duration::minutes(10))
        .expect("reclaim");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].worker_id.as_deref(), Some("worker-b"));

    // worker B reruns the job; the per-folder pre-clear makes the restart
    // converge to a single successful run
    let stats = harness
        .engine
        .run_full(&reclaimed[0])
        .await
        .expect("rerun full sync");
    assert_eq!(stats.messages_synced, 3);

    assert_eq!(
        harness
            .db
            .count_messages_for_connection(&connection.id)
            .expect("count"),
        3
    );
    let job = harness.queue.get(&job.id).expect("get").expect("row");
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job
        .status_message
        .as_deref()
        .is_some_and(|m| m.contains("reassigned from worker-a")));
}

#[tokio::test]
async fn cancelled_job_exits_cleanly_at_first_checkpoint() {
    let harness = TestHarness::new(three_message_mailbox());
    let connection = harness.insert_connection(None);

    let job = harness
        .queue
        .enqueue(&connection, SyncType::Full, PRIORITY_USER)
        .expect("enqueue");
    assert!(harness.queue.cancel("user-1", &job.id).expect("cancel"));

    let result = harness.engine.run_full(&job).await;
    assert!(matches!(result, Err(SyncError::Cancelled)));

    let connection = harness
        .db
        .get_connection(&connection.id)
        .expect("get")
        .expect("exists");
    assert!(!connection.sync_in_progress, "latch reset on cancel path");
    assert_eq!(connection.sync_status, SyncStatus::Idle);

    let job = harness.queue.get(&job.id).expect("get").expect("row");
    assert_eq!(job.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn pagination_walks_every_page_of_a_folder() {
    let mut state = three_message_mailbox();
    let ids: Vec<String> = (0..5).map(|i| format!("p-{i}")).collect();
    for id in &ids {
        state
            .messages
            .insert(id.clone(), provider_message(id, &["INBOX"], id));
    }
    state
        .folder_messages
        .insert("INBOX".to_string(), ids.clone());
    state.page_size_limit = 2; // force three pages for the inbox

    let harness = TestHarness::new(state);
    let connection = harness.insert_connection(None);
    let job = harness
        .queue
        .enqueue(&connection, SyncType::Full, PRIORITY_USER)
        .expect("enqueue");

    let stats = harness.engine.run_full(&job).await.expect("full sync");
    // 5 inbox + m-3 in sent
    assert_eq!(stats.messages_synced, 6);
    assert_eq!(
        harness
            .db
            .count_messages_for_connection(&connection.id)
            .expect("count"),
        6
    );
}
