use chrono::{DateTime, Duration, Timelike, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::db::models::{SyncStatus, SyncType};
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::jobs::{JobQueue, PRIORITY_SCHEDULED};
use crate::watch::WatchManager;

const SYNC_SCHEDULE_LOCK: &str = "sync-schedule";
const WORKER_REAPER_LOCK: &str = "worker-reaper";
const WATCH_RENEW_LOCK: &str = "watch-renew";

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub enqueue_interval: std::time::Duration,
    pub reaper_interval: std::time::Duration,
    pub watch_check_interval: std::time::Duration,
    pub worker_inactive_timeout: Duration,
    pub watch_expiry_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enqueue_interval: std::time::Duration::from_secs(300),
            reaper_interval: std::time::Duration::from_secs(60),
            watch_check_interval: std::time::Duration::from_secs(3600),
            worker_inactive_timeout: Duration::minutes(5),
            watch_expiry_window: Duration::hours(24),
        }
    }
}

/// Periodic tasks, each guarded by a DistLock whose id encodes the task and
/// its time bucket: acquire by insert, skip silently on conflict. That is
/// what keeps the timers safe when N replicas run them.
pub struct Scheduler {
    db: Database,
    queue: JobQueue,
    watches: WatchManager,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(db: Database, queue: JobQueue, watches: WatchManager) -> Self {
        Self {
            db,
            queue,
            watches,
            config: SchedulerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut enqueue_timer = tokio::time::interval(self.config.enqueue_interval);
        let mut reaper_timer = tokio::time::interval(self.config.reaper_interval);
        let mut watch_timer = tokio::time::interval(self.config.watch_check_interval);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler stopping");
                        return;
                    }
                }
                _ = enqueue_timer.tick() => {
                    if let Err(err) = self.enqueue_due_syncs().await {
                        error!(%err, "scheduled sync enqueue failed");
                    }
                }
                _ = reaper_timer.tick() => {
                    if let Err(err) = self.reap_inactive_workers() {
                        error!(%err, "worker reaper failed");
                    }
                }
                _ = watch_timer.tick() => {
                    // daily task: only the midnight bucket does work
                    if Utc::now().hour() == 0 {
                        if let Err(err) = self.renew_expiring_watches().await {
                            error!(%err, "watch renewal failed");
                        }
                    }
                }
            }
        }
    }

    /// Every 5 minutes: enqueue incremental syncs for connections past
    /// their frequency window with no job already pending.
    pub async fn enqueue_due_syncs(&self) -> SyncResult<usize> {
        let now = Utc::now();
        let lock_id = bucket_lock_id(SYNC_SCHEDULE_LOCK, now, 5);
        let Some(_guard) = LockGuard::try_acquire(&self.db, &lock_id, Duration::minutes(5))?
        else {
            return Ok(0);
        };

        let mut enqueued = 0;
        for connection in self.db.list_sync_enabled_connections()? {
            if connection.sync_in_progress {
                continue;
            }
            if connection.sync_status == SyncStatus::RequiresReauth {
                continue;
            }

            let due = match connection.last_synced_at {
                None => true,
                Some(last) => {
                    last + Duration::minutes(connection.sync_frequency_minutes) <= now
                }
            };
            if !due {
                continue;
            }

            if self.db.find_active_job(&connection.id)?.is_some() {
                continue;
            }

            match self
                .queue
                .enqueue(&connection, SyncType::Incremental, PRIORITY_SCHEDULED)
            {
                Ok(job) => {
                    info!(job = %job.id, connection = %connection.id, "scheduled incremental sync");
                    enqueued += 1;
                }
                Err(SyncError::ConflictingJobInProgress(_)) => {}
                Err(error) => {
                    warn!(connection = %connection.id, %error, "scheduled enqueue failed");
                }
            }
        }

        Ok(enqueued)
    }

    /// Every minute: mark workers silent past the timeout inactive and make
    /// their jobs reclaimable.
    pub fn reap_inactive_workers(&self) -> SyncResult<usize> {
        let now = Utc::now();
        let lock_id = bucket_lock_id(WORKER_REAPER_LOCK, now, 1);
        let Some(_guard) = LockGuard::try_acquire(&self.db, &lock_id, Duration::minutes(1))?
        else {
            return Ok(0);
        };

        let cutoff = now - self.config.worker_inactive_timeout;
        let stale = self.db.mark_stale_workers_inactive(cutoff)?;

        for worker_id in &stale {
            let released = self.db.release_jobs_for_worker(
                worker_id,
                Some(&format!("[released from inactive worker {worker_id}]")),
            )?;
            if released > 0 {
                warn!(worker = %worker_id, released, "released jobs from inactive worker");
            }
        }

        Ok(stale.len())
    }

    /// Daily: reinstall push watches that are inside the 24h expiry window.
    pub async fn renew_expiring_watches(&self) -> SyncResult<usize> {
        let now = Utc::now();
        let lock_id = format!("{WATCH_RENEW_LOCK}-{}", now.format("%Y-%m-%d"));
        let Some(_guard) = LockGuard::try_acquire(&self.db, &lock_id, Duration::hours(1))? else {
            return Ok(0);
        };

        let cutoff = now + self.config.watch_expiry_window;
        let mut renewed = 0;
        for mut connection in self.db.list_connections_with_expiring_watch(cutoff)? {
            match self.watches.renew(&mut connection).await {
                Ok(()) => renewed += 1,
                Err(error) => {
                    // one sick connection must not block the rest
                    warn!(connection = %connection.id, %error, "watch renewal failed");
                }
            }
        }

        Ok(renewed)
    }
}

/// Lock name encodes the task and the time bucket, so each bucket is a
/// fresh mutual exclusion round.
fn bucket_lock_id(prefix: &str, now: DateTime<Utc>, bucket_minutes: u32) -> String {
    let minute = now.minute() - (now.minute() % bucket_minutes);
    format!(
        "{prefix}-{}T{:02}:{:02}",
        now.format("%Y-%m-%d"),
        now.hour(),
        minute
    )
}

/// Held lock released in a guaranteed-exit step; the TTL covers a holder
/// that crashes before Drop runs.
struct LockGuard {
    db: Database,
    lock_id: String,
}

impl LockGuard {
    fn try_acquire(db: &Database, lock_id: &str, ttl: Duration) -> SyncResult<Option<Self>> {
        if !db.try_acquire_lock(lock_id, ttl)? {
            return Ok(None);
        }
        Ok(Some(Self {
            db: db.clone(),
            lock_id: lock_id.to_string(),
        }))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(error) = self.db.release_lock(&self.lock_id) {
            warn!(lock = %self.lock_id, %error, "failed to release scheduler lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::{bucket_lock_id, Scheduler};
    use crate::db::models::{
        EmailConnection, JobStatus, Provider, SyncStatus, SyncType, WorkerRecord, WorkerStatus,
    };
    use crate::db::Database;
    use crate::jobs::JobQueue;
    use crate::providers::ProviderRegistry;
    use crate::token::TokenManager;
    use crate::watch::WatchManager;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mailsync-scheduler-test-{}.db", Uuid::new_v4()))
    }

    fn scheduler(db: &Database) -> Scheduler {
        let providers = Arc::new(ProviderRegistry::new());
        let queue = JobQueue::new(db.clone());
        let tokens = TokenManager::new(db.clone(), providers.clone());
        let watches = WatchManager::new(
            db.clone(),
            providers,
            tokens,
            queue.clone(),
            "projects/test/topics/mail".to_string(),
        );
        Scheduler::new(db.clone(), queue, watches)
    }

    fn connection(db: &Database, email: &str, last_synced_minutes_ago: Option<i64>) -> EmailConnection {
        db.upsert_connection(&EmailConnection {
            id: Uuid::new_v4().to_string(),
            user_id: "user-1".to_string(),
            provider: Provider::Gmail,
            email: email.to_string(),
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_expires_at: None,
            latest_history_id: Some("100".to_string()),
            last_synced_at: last_synced_minutes_ago.map(|m| Utc::now() - Duration::minutes(m)),
            sync_frequency_minutes: 15,
            sync_batch_size: 50,
            sync_enabled: true,
            sync_status: SyncStatus::Idle,
            sync_in_progress: false,
            sync_error: None,
            last_sync_error_at: None,
            watch_resource_id: None,
            watch_history_id: None,
            watch_expiration: None,
            created_at: Utc::now(),
        })
        .expect("upsert connection")
    }

    #[test]
    fn bucket_ids_are_stable_within_a_bucket() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 11).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 3, 1, 10, 4, 59).unwrap();
        let c = Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap();

        assert_eq!(
            bucket_lock_id("sync-schedule", a, 5),
            "sync-schedule-2026-03-01T10:00"
        );
        assert_eq!(bucket_lock_id("sync-schedule", a, 5), bucket_lock_id("sync-schedule", b, 5));
        assert_ne!(bucket_lock_id("sync-schedule", b, 5), bucket_lock_id("sync-schedule", c, 5));
        assert_eq!(
            bucket_lock_id("worker-reaper", a, 1),
            "worker-reaper-2026-03-01T10:02"
        );
    }

    #[tokio::test]
    async fn enqueues_only_due_connections() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let scheduler = scheduler(&db);

        let never_synced = connection(&db, "never@example.com", None);
        let overdue = connection(&db, "overdue@example.com", Some(30));
        let fresh = connection(&db, "fresh@example.com", Some(1));

        let enqueued = scheduler.enqueue_due_syncs().await.expect("enqueue pass");
        assert_eq!(enqueued, 2);

        assert!(db.find_active_job(&never_synced.id).expect("job").is_some());
        let overdue_job = db
            .find_active_job(&overdue.id)
            .expect("job")
            .expect("overdue job");
        assert_eq!(overdue_job.sync_type, SyncType::Incremental);
        assert_eq!(overdue_job.status, JobStatus::InProgress);
        assert!(db.find_active_job(&fresh.id).expect("job").is_none());

        // the same bucket runs once: the lock is released on exit, but the
        // connections now carry pending jobs so nothing new is enqueued
        let again = scheduler.enqueue_due_syncs().await.expect("second pass");
        assert_eq!(again, 0);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn skips_connections_needing_reauth_or_latched() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let scheduler = scheduler(&db);

        let revoked = connection(&db, "revoked@example.com", None);
        db.mark_connection_requires_reauth(&revoked.id, "invalid_grant")
            .expect("mark reauth");

        let latched = connection(&db, "latched@example.com", None);
        assert!(db.try_begin_connection_sync(&latched.id).expect("latch"));

        let enqueued = scheduler.enqueue_due_syncs().await.expect("enqueue pass");
        assert_eq!(enqueued, 0);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn reaper_marks_stale_workers_and_releases_their_jobs() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let scheduler = scheduler(&db);
        let queue = JobQueue::new(db.clone());

        let conn = connection(&db, "a@example.com", None);
        let job = queue
            .enqueue(&conn, SyncType::Full, crate::jobs::PRIORITY_USER)
            .expect("enqueue");
        assert_eq!(queue.claim_next("host-dead", 1).expect("claim").len(), 1);

        db.upsert_worker(&WorkerRecord {
            worker_id: "host-dead".to_string(),
            hostname: "host".to_string(),
            status: WorkerStatus::Processing,
            last_heartbeat: Utc::now() - Duration::minutes(10),
            current_job_id: Some(job.id.clone()),
            jobs_processed_count: 0,
            started_at: Utc::now() - Duration::hours(1),
        })
        .expect("worker record");

        let reaped = scheduler.reap_inactive_workers().expect("reap");
        assert_eq!(reaped, 1);

        let record = db.get_worker("host-dead").expect("get").expect("exists");
        assert_eq!(record.status, WorkerStatus::Inactive);

        let released = queue.get(&job.id).expect("get job").expect("exists");
        assert_eq!(released.status, JobStatus::InProgress);
        assert!(released.worker_id.is_none());
        assert!(released
            .status_message
            .as_deref()
            .is_some_and(|m| m.contains("inactive worker")));

        // another worker can now claim it
        assert_eq!(queue.claim_next("host-live", 1).expect("reclaim").len(), 1);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn bucket_lock_blocks_second_scheduler_in_same_bucket() {
        let path = temp_db_path();
        let db = Database::open(&path).expect("open db");
        let scheduler_a = scheduler(&db);

        connection(&db, "a@example.com", None);

        // hold this bucket's lock as a competing replica would
        let now = Utc::now();
        let lock_id = bucket_lock_id("sync-schedule", now, 5);
        assert!(db
            .try_acquire_lock(&lock_id, Duration::minutes(5))
            .expect("competitor lock"));

        let enqueued = scheduler_a.enqueue_due_syncs().await.expect("pass");
        assert_eq!(enqueued, 0, "skips silently while the bucket lock is held");

        let _ = std::fs::remove_file(path);
    }
}
