use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::models::{SyncJob, SyncType, WorkerRecord, WorkerStatus};
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::jobs::JobQueue;
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub max_consecutive_failures: u32,
    pub retry_delay: Duration,
    pub job_lock_timeout: chrono::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            max_concurrent_jobs: 1,
            max_consecutive_failures: 3,
            retry_delay: Duration::from_secs(60),
            job_lock_timeout: chrono::Duration::minutes(10),
        }
    }
}

/// Long-running job processor. Registers itself, heartbeats, claims jobs
/// through the queue's conditional updates, and releases its claims on
/// shutdown. All coordination goes through the store.
pub struct Worker {
    id: String,
    hostname: String,
    db: Database,
    queue: JobQueue,
    engine: SyncEngine,
    config: WorkerConfig,
    jobs_processed: Arc<AtomicI64>,
    consecutive_failures: u32,
}

impl Worker {
    pub fn new(db: Database, queue: JobQueue, engine: SyncEngine, config: WorkerConfig) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{hostname}-{}", &suffix[..8]);

        Self {
            id,
            hostname,
            db,
            queue,
            engine,
            config,
            jobs_processed: Arc::new(AtomicI64::new(0)),
            consecutive_failures: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn register(&self) -> SyncResult<()> {
        let now = Utc::now();
        self.db.upsert_worker(&WorkerRecord {
            worker_id: self.id.clone(),
            hostname: self.hostname.clone(),
            status: WorkerStatus::Active,
            last_heartbeat: now,
            current_job_id: None,
            jobs_processed_count: 0,
            started_at: now,
        })?;
        info!(worker = %self.id, "worker registered");
        Ok(())
    }

    /// Poll → reclaim abandoned work first, then claim fresh jobs, and run
    /// everything we own strictly serially.
    pub async fn poll_once(&mut self) -> SyncResult<usize> {
        let mut jobs = self
            .queue
            .reclaim_abandoned(&self.id, self.config.job_lock_timeout)?;
        if jobs.len() < self.config.max_concurrent_jobs {
            let remaining = self.config.max_concurrent_jobs - jobs.len();
            jobs.extend(self.queue.claim_next(&self.id, remaining)?);
        }

        let count = jobs.len();
        for job in jobs {
            self.execute(job).await;
        }
        Ok(count)
    }

    async fn execute(&mut self, job: SyncJob) {
        let _ = self.db.set_worker_status(&self.id, WorkerStatus::Processing);
        let _ = self.db.set_worker_current_job(&self.id, Some(&job.id));
        info!(worker = %self.id, job = %job.id, sync_type = %job.sync_type, "executing job");

        let result = match job.sync_type {
            SyncType::Full => self.engine.run_full(&job).await.map(|_| ()),
            SyncType::Incremental => self.engine.run_incremental_job(&job).await.map(|_| ()),
        };

        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.jobs_processed.fetch_add(1, Ordering::SeqCst);
            }
            Err(SyncError::Cancelled) => {
                // user-requested stop; committed writes stay, no failure mark
                info!(worker = %self.id, job = %job.id, "job cancelled, exited cleanly");
            }
            Err(SyncError::TokenRevoked(reason)) => {
                // connection already flipped to requires_reauth by TokenManager
                if let Err(error) = self
                    .queue
                    .fail(&job.id, &format!("provider token revoked: {reason}"))
                {
                    error!(job = %job.id, %error, "failed to mark job failed");
                }
                self.consecutive_failures += 1;
            }
            Err(other) => {
                if let Err(error) = self.queue.fail(&job.id, &other.to_string()) {
                    error!(job = %job.id, %error, "failed to mark job failed");
                }
                self.consecutive_failures += 1;
            }
        }

        let _ = self.db.set_worker_current_job(&self.id, None);
        let _ = self.db.set_worker_status(&self.id, WorkerStatus::Active);

        if self.consecutive_failures >= self.config.max_consecutive_failures {
            warn!(
                worker = %self.id,
                failures = self.consecutive_failures,
                "failure threshold reached, pausing"
            );
            let _ = self.db.set_worker_status(&self.id, WorkerStatus::Error);
            sleep(self.config.retry_delay).await;
            self.consecutive_failures = 0;
            let _ = self.db.set_worker_status(&self.id, WorkerStatus::Active);
        }
    }

    /// Main loop: heartbeat on its own task so a long sync cannot silence
    /// liveness, poll on this one. `shutdown` flipping to true drains and
    /// releases claims.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SyncResult<()> {
        self.register()?;

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.db.clone(),
            self.id.clone(),
            self.jobs_processed.clone(),
            self.config.heartbeat_interval,
            shutdown.clone(),
        ));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = sleep(self.config.poll_interval) => {
                    if let Err(error) = self.poll_once().await {
                        error!(worker = %self.id, %error, "poll failed");
                    }
                }
            }
        }

        info!(worker = %self.id, "worker draining");
        let released = self.queue.release_all(&self.id)?;
        if released > 0 {
            info!(worker = %self.id, released, "released unfinished jobs for reclamation");
        }
        self.db.set_worker_status(&self.id, WorkerStatus::Stopped)?;
        heartbeat.abort();

        Ok(())
    }
}

async fn heartbeat_loop(
    db: Database,
    worker_id: String,
    jobs_processed: Arc<AtomicI64>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = sleep(interval) => {
                let count = jobs_processed.load(Ordering::SeqCst);
                if let Err(error) = db.heartbeat_worker(&worker_id, count) {
                    warn!(worker = %worker_id, %error, "heartbeat failed");
                }
            }
        }
    }
}
