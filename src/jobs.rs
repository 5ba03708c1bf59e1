use chrono::{Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{EmailConnection, JobStatus, SyncJob, SyncType};
use crate::db::{Database, ProgressUpdate};
use crate::error::{SyncError, SyncResult};

/// Scheduled work sorts below anything a user asked for directly; the queue
/// orders claims by priority descending.
pub const PRIORITY_SCHEDULED: i64 = 2;
pub const PRIORITY_USER: i64 = 5;

pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Durable at-most-one-worker-per-job claim discipline over sync_jobs rows.
/// There is no in-memory queue; the database is the queue.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fails with ConflictingJobInProgress carrying the existing job id when
    /// a non-terminal job already exists for the connection. Callers may
    /// treat that as "already running".
    pub fn enqueue(
        &self,
        connection: &EmailConnection,
        sync_type: SyncType,
        priority: i64,
    ) -> SyncResult<SyncJob> {
        let now = Utc::now();
        let job = SyncJob {
            id: Uuid::new_v4().to_string(),
            user_id: connection.user_id.clone(),
            connection_id: connection.id.clone(),
            provider: connection.provider,
            sync_type,
            status: JobStatus::InProgress,
            priority,
            progress: 0,
            folders_completed: 0,
            total_folders: 0,
            messages_synced: 0,
            current_folder: None,
            status_message: None,
            started_at: now,
            completed_at: None,
            latest_history_id: None,
            worker_id: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            updated_at: now,
        };

        if self.db.insert_job_if_idle(&job)? {
            info!(job = %job.id, connection = %connection.id, %sync_type, "enqueued sync job");
            return Ok(job);
        }

        let existing = self
            .db
            .find_active_job(&connection.id)?
            .map(|job| job.id)
            .unwrap_or_default();
        Err(SyncError::ConflictingJobInProgress(existing))
    }

    /// Claim up to `max` unowned jobs. The conditional update is the claim:
    /// only rows whose update affected exactly one row are ours.
    pub fn claim_next(&self, worker_id: &str, max: usize) -> SyncResult<Vec<SyncJob>> {
        let mut claimed = Vec::new();

        for candidate in self.db.list_claimable_jobs(max.max(1) * 4)? {
            if claimed.len() >= max {
                break;
            }
            if self.db.try_claim_job(&candidate.id, worker_id)? {
                if let Some(job) = self.db.get_job(&candidate.id)? {
                    claimed.push(job);
                }
            }
        }

        Ok(claimed)
    }

    /// Take over jobs whose owner stopped updating them. Scoped to the
    /// worker we observed holding the row so racing reclaimers cannot both
    /// win.
    pub fn reclaim_abandoned(
        &self,
        worker_id: &str,
        lock_timeout: Duration,
    ) -> SyncResult<Vec<SyncJob>> {
        let cutoff = Utc::now() - lock_timeout;
        let mut reclaimed = Vec::new();

        for candidate in self.db.list_abandoned_jobs(cutoff)? {
            let Some(previous_owner) = candidate.worker_id.as_deref() else {
                continue;
            };
            let note = format!("[reassigned from {previous_owner} to {worker_id}]");
            if self
                .db
                .try_reassign_job(&candidate.id, previous_owner, worker_id, &note)?
            {
                warn!(
                    job = %candidate.id,
                    from = previous_owner,
                    to = worker_id,
                    "reclaimed abandoned job"
                );
                if let Some(job) = self.db.get_job(&candidate.id)? {
                    reclaimed.push(job);
                }
            }
        }

        Ok(reclaimed)
    }

    /// Best-effort: a failed progress write must not abort the sync, so the
    /// caller logs and continues.
    pub fn report_progress(&self, job_id: &str, update: ProgressUpdate) -> SyncResult<()> {
        self.db.update_job_progress(job_id, &update)?;
        Ok(())
    }

    pub fn complete(
        &self,
        job_id: &str,
        messages_synced: Option<i64>,
        latest_history_id: Option<&str>,
        status_message: Option<&str>,
    ) -> SyncResult<()> {
        self.db
            .complete_job(job_id, messages_synced, latest_history_id, status_message)?;
        Ok(())
    }

    pub fn fail(&self, job_id: &str, reason: &str) -> SyncResult<()> {
        self.db.fail_job(job_id, reason)?;
        Ok(())
    }

    /// Conditional: only the owning user can cancel, and only while the job
    /// is still in progress.
    pub fn cancel(&self, user_id: &str, job_id: &str) -> SyncResult<bool> {
        Ok(self.db.cancel_job(user_id, job_id)?)
    }

    pub fn is_cancelled(&self, job_id: &str) -> SyncResult<bool> {
        Ok(matches!(
            self.db.get_job_status(job_id)?,
            Some(JobStatus::Cancelled)
        ))
    }

    /// Worker shutdown: drop ownership but leave status in_progress so
    /// another worker reclaims the work.
    pub fn release_all(&self, worker_id: &str) -> SyncResult<usize> {
        Ok(self.db.release_jobs_for_worker(worker_id, None)?)
    }

    pub fn get(&self, job_id: &str) -> SyncResult<Option<SyncJob>> {
        Ok(self.db.get_job(job_id)?)
    }

    pub fn get_for_user(&self, user_id: &str, job_id: &str) -> SyncResult<Option<SyncJob>> {
        Ok(self.db.get_job_for_user(user_id, job_id)?)
    }

    pub fn recent_for_user(&self, user_id: &str, limit: usize) -> SyncResult<Vec<SyncJob>> {
        Ok(self.db.list_recent_jobs(user_id, limit)?)
    }
}
