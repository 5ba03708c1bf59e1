use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, ToSql};
use thiserror::Error;

use crate::crypto;

pub mod migrations;
pub mod models;
pub mod schema;

use self::models::{
    fmt_ts, CachedMessage, EmailConnection, Folder, JobStatus, SyncJob, SyncLock, SyncStatus,
    WorkerRecord, WorkerStatus,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("token crypto: {0}")]
    TokenCrypto(String),

    #[error("connection mutex poisoned")]
    Poisoned,

    #[error("{0}")]
    Config(String),
}

/// Optional per-field job update; None leaves the column unchanged.
/// Any update refreshes updated_at, which doubles as the job-level
/// liveness signal for reclamation.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub progress: Option<i64>,
    pub folders_completed: Option<i64>,
    pub total_folders: Option<i64>,
    pub messages_synced: Option<i64>,
    pub current_folder: Option<String>,
    pub status_message: Option<String>,
}

/// Shared handle over the SQLite store. Cloneable; the inner connection is
/// serialized behind a mutex so worker, scheduler, and API tasks can share
/// one handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<rusqlite::Connection>>,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = rusqlite::Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        migrations::migrate(&conn).map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn seal(token: &str) -> Result<String, DbError> {
        crypto::seal_token(token).map_err(|e| DbError::TokenCrypto(e.to_string()))
    }

    fn open_sealed(stored: &str) -> Result<String, DbError> {
        crypto::open_token(stored).map_err(|e| DbError::TokenCrypto(e.to_string()))
    }

    fn unseal_connection(mut connection: EmailConnection) -> Result<EmailConnection, DbError> {
        connection.access_token = Self::open_sealed(&connection.access_token)?;
        connection.refresh_token = Self::open_sealed(&connection.refresh_token)?;
        Ok(connection)
    }

    // --- connections ---

    /// Upsert keyed on (user_id, email): a re-attach refreshes tokens and
    /// re-enables the provider link without losing sync state.
    pub fn upsert_connection(
        &self,
        connection: &EmailConnection,
    ) -> Result<EmailConnection, DbError> {
        let access_token = Self::seal(&connection.access_token)?;
        let refresh_token = Self::seal(&connection.refresh_token)?;

        {
            let conn = self.lock()?;
            conn.execute(
                r#"
                INSERT INTO connections (
                    id, user_id, provider, email, access_token, refresh_token,
                    token_expires_at, latest_history_id, last_synced_at,
                    sync_frequency_minutes, sync_batch_size, sync_enabled, sync_status,
                    sync_in_progress, sync_error, last_sync_error_at,
                    watch_resource_id, watch_history_id, watch_expiration, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id, email) DO UPDATE SET
                    provider = excluded.provider,
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    token_expires_at = excluded.token_expires_at,
                    sync_status = excluded.sync_status,
                    sync_error = NULL
                "#,
                params![
                    connection.id,
                    connection.user_id,
                    connection.provider.to_string(),
                    connection.email,
                    access_token,
                    refresh_token,
                    connection.token_expires_at.map(fmt_ts),
                    connection.latest_history_id,
                    connection.last_synced_at.map(fmt_ts),
                    connection.sync_frequency_minutes,
                    connection.sync_batch_size,
                    connection.sync_enabled,
                    connection.sync_status.to_string(),
                    connection.sync_in_progress,
                    connection.sync_error,
                    connection.last_sync_error_at.map(fmt_ts),
                    connection.watch_resource_id,
                    connection.watch_history_id,
                    connection.watch_expiration.map(fmt_ts),
                    fmt_ts(connection.created_at),
                ],
            )?;
        }

        self.get_connection_by_email(&connection.user_id, &connection.email)?
            .ok_or_else(|| DbError::Config("upserted connection not found on re-read".to_string()))
    }

    pub fn get_connection(&self, id: &str) -> Result<Option<EmailConnection>, DbError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT * FROM connections WHERE id = ? LIMIT 1",
                [id],
                EmailConnection::from_row,
            )
            .optional()?;
        row.map(Self::unseal_connection).transpose()
    }

    pub fn get_connection_for_user(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<EmailConnection>, DbError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT * FROM connections WHERE id = ? AND user_id = ? LIMIT 1",
                params![id, user_id],
                EmailConnection::from_row,
            )
            .optional()?;
        row.map(Self::unseal_connection).transpose()
    }

    pub fn get_connection_by_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<Option<EmailConnection>, DbError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT * FROM connections WHERE user_id = ? AND email = ? LIMIT 1",
                params![user_id, email],
                EmailConnection::from_row,
            )
            .optional()?;
        row.map(Self::unseal_connection).transpose()
    }

    pub fn find_connection_by_watch_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<EmailConnection>, DbError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT * FROM connections WHERE watch_resource_id = ? LIMIT 1",
                [resource_id],
                EmailConnection::from_row,
            )
            .optional()?;
        row.map(Self::unseal_connection).transpose()
    }

    pub fn list_sync_enabled_connections(&self) -> Result<Vec<EmailConnection>, DbError> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("SELECT * FROM connections WHERE sync_enabled = true ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], EmailConnection::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(Self::unseal_connection).collect()
    }

    pub fn list_connections_with_expiring_watch(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EmailConnection>, DbError> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                r#"
                SELECT * FROM connections
                WHERE provider = 'gmail'
                  AND watch_resource_id IS NOT NULL
                  AND watch_expiration IS NOT NULL
                  AND watch_expiration < ?
                ORDER BY watch_expiration ASC
                "#,
            )?;
            let rows = stmt
                .query_map([fmt_ts(cutoff)], EmailConnection::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(Self::unseal_connection).collect()
    }

    pub fn update_connection_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let access_token = Self::seal(access_token)?;
        let refresh_token = Self::seal(refresh_token)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE connections
            SET access_token = ?, refresh_token = ?, token_expires_at = ?
            WHERE id = ?
            "#,
            params![access_token, refresh_token, fmt_ts(expires_at), id],
        )?;
        Ok(())
    }

    pub fn set_connection_sync_status(
        &self,
        id: &str,
        status: SyncStatus,
    ) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE connections SET sync_status = ? WHERE id = ?",
            params![status.to_string(), id],
        )?;
        Ok(())
    }

    pub fn set_connection_sync_error(&self, id: &str, message: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE connections
            SET sync_status = 'error', sync_error = ?, last_sync_error_at = ?
            WHERE id = ?
            "#,
            params![message, fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Terminal until the user reconnects. Tokens are left in place so a
    /// re-attach can reuse the row.
    pub fn mark_connection_requires_reauth(&self, id: &str, reason: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE connections
            SET sync_status = 'requires_reauth', sync_error = ?, last_sync_error_at = ?
            WHERE id = ?
            "#,
            params![reason, fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Per-connection latch. Returns false when another task already holds
    /// the connection; the caller short-circuits.
    pub fn try_begin_connection_sync(&self, id: &str) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE connections SET sync_in_progress = true WHERE id = ? AND sync_in_progress = false",
            [id],
        )?;
        Ok(affected == 1)
    }

    pub fn end_connection_sync(&self, id: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE connections SET sync_in_progress = false WHERE id = ?",
            [id],
        )?;
        Ok(())
    }

    /// Successful full sync: store the cursor the next incremental resumes
    /// from, stamp last_synced_at, clear error state, and enable scheduled
    /// syncs for this connection.
    pub fn finalize_connection_sync(
        &self,
        id: &str,
        latest_history_id: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE connections
            SET latest_history_id = COALESCE(?, latest_history_id),
                last_synced_at = ?,
                sync_status = 'idle',
                sync_error = NULL,
                sync_enabled = true,
                sync_in_progress = false
            WHERE id = ?
            "#,
            params![latest_history_id, fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    pub fn touch_last_synced(&self, id: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE connections SET last_synced_at = ?, sync_status = 'idle', sync_error = NULL WHERE id = ?",
            params![fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// History cursors only move forward. Gmail history ids are integers as
    /// strings, so the guard compares them numerically; the second of two
    /// racing writers for the same underlying change is a no-op.
    pub fn advance_history_cursor(&self, id: &str, history_id: &str) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            r#"
            UPDATE connections
            SET latest_history_id = ?, watch_history_id = ?
            WHERE id = ?
              AND (latest_history_id IS NULL
                   OR CAST(latest_history_id AS INTEGER) < CAST(? AS INTEGER))
            "#,
            params![history_id, history_id, id, history_id],
        )?;
        Ok(affected == 1)
    }

    pub fn update_watch(
        &self,
        id: &str,
        resource_id: Option<&str>,
        history_id: Option<&str>,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE connections
            SET watch_resource_id = ?, watch_history_id = COALESCE(?, watch_history_id),
                watch_expiration = ?
            WHERE id = ?
            "#,
            params![resource_id, history_id, expiration.map(fmt_ts), id],
        )?;
        Ok(())
    }

    pub fn delete_connection(&self, user_id: &str, id: &str) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM connections WHERE id = ? AND user_id = ?",
            params![id, user_id],
        )?;
        Ok(deleted)
    }

    // --- folders ---

    pub fn insert_folder(&self, folder: &Folder) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO folders (
                id, user_id, connection_id, name, folder_type, provider_folder_id
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                folder.id,
                folder.user_id,
                folder.connection_id,
                folder.name,
                folder.folder_type.to_string(),
                folder.provider_folder_id,
            ],
        )?;
        Ok(())
    }

    pub fn list_folders(&self, connection_id: &str) -> Result<Vec<Folder>, DbError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM folders WHERE connection_id = ? ORDER BY name ASC")?;
        let folders = stmt
            .query_map([connection_id], Folder::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(folders)
    }

    pub fn find_folder_by_type(
        &self,
        connection_id: &str,
        folder_type: models::FolderType,
    ) -> Result<Option<Folder>, DbError> {
        let conn = self.lock()?;
        let folder = conn
            .query_row(
                "SELECT * FROM folders WHERE connection_id = ? AND folder_type = ? LIMIT 1",
                params![connection_id, folder_type.to_string()],
                Folder::from_row,
            )
            .optional()?;
        Ok(folder)
    }

    // --- cached messages ---

    pub fn upsert_message(&self, message: &CachedMessage) -> Result<(), DbError> {
        let conn = self.lock()?;
        Self::upsert_message_inner(&conn, message)
    }

    /// One transaction per sub-batch so a crash mid-folder leaves whole
    /// batches, never torn rows.
    pub fn upsert_messages(&self, messages: &[CachedMessage]) -> Result<(), DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for message in messages {
            Self::upsert_message_inner(&tx, message)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn upsert_message_inner(
        conn: &rusqlite::Connection,
        message: &CachedMessage,
    ) -> Result<(), DbError> {
        let recipients = serde_json::to_string(&message.recipients)?;
        let cc = serde_json::to_string(&message.cc)?;
        let attachments = serde_json::to_string(&message.attachments)?;

        conn.execute(
            r#"
            INSERT INTO cached_messages (
                id, user_id, connection_id, provider_email_id, folder_id, subject, sender,
                recipients, cc, date, body_html, body_preview, read, starred, attachments,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, connection_id, provider_email_id) DO UPDATE SET
                folder_id = excluded.folder_id,
                subject = excluded.subject,
                sender = excluded.sender,
                recipients = excluded.recipients,
                cc = excluded.cc,
                date = excluded.date,
                body_html = excluded.body_html,
                body_preview = excluded.body_preview,
                read = excluded.read,
                starred = excluded.starred,
                attachments = excluded.attachments,
                updated_at = excluded.updated_at
            "#,
            params![
                message.id,
                message.user_id,
                message.connection_id,
                message.provider_email_id,
                message.folder_id,
                message.subject,
                message.sender,
                recipients,
                cc,
                message.date,
                message.body_html,
                message.body_preview,
                message.read,
                message.starred,
                attachments,
                fmt_ts(message.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn delete_folder_messages(
        &self,
        user_id: &str,
        connection_id: &str,
        folder_id: &str,
    ) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM cached_messages WHERE user_id = ? AND connection_id = ? AND folder_id = ?",
            params![user_id, connection_id, folder_id],
        )?;
        Ok(deleted)
    }

    pub fn delete_messages_by_provider_ids(
        &self,
        connection_id: &str,
        provider_email_ids: &[String],
    ) -> Result<usize, DbError> {
        if provider_email_ids.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; provider_email_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM cached_messages WHERE connection_id = ? AND provider_email_id IN ({placeholders})"
        );

        let mut params_vec: Vec<Box<dyn ToSql>> = Vec::with_capacity(provider_email_ids.len() + 1);
        params_vec.push(Box::new(connection_id.to_string()));
        for id in provider_email_ids {
            params_vec.push(Box::new(id.clone()));
        }
        let params_refs: Vec<&dyn ToSql> = params_vec.iter().map(|v| v.as_ref()).collect();

        let conn = self.lock()?;
        let deleted = conn.execute(&sql, params_refs.as_slice())?;
        Ok(deleted)
    }

    pub fn get_message_by_provider_id(
        &self,
        connection_id: &str,
        provider_email_id: &str,
    ) -> Result<Option<CachedMessage>, DbError> {
        let conn = self.lock()?;
        let message = conn
            .query_row(
                "SELECT * FROM cached_messages WHERE connection_id = ? AND provider_email_id = ? LIMIT 1",
                params![connection_id, provider_email_id],
                CachedMessage::from_row,
            )
            .optional()?;
        Ok(message)
    }

    pub fn count_messages_for_connection(&self, connection_id: &str) -> Result<i64, DbError> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM cached_messages WHERE connection_id = ?",
            [connection_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // --- sync jobs ---

    /// Insert-if-idle: the WHERE NOT EXISTS guard makes the one-active-job-
    /// per-connection invariant a single atomic statement. Returns false
    /// when a non-terminal job already exists.
    pub fn insert_job_if_idle(&self, job: &SyncJob) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            r#"
            INSERT INTO sync_jobs (
                id, user_id, connection_id, provider, sync_type, status, priority,
                progress, folders_completed, total_folders, messages_synced,
                current_folder, status_message, started_at, completed_at,
                latest_history_id, worker_id, retry_count, max_retries,
                created_at, updated_at
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_jobs
                WHERE connection_id = ? AND status = 'in_progress'
            )
            "#,
            params![
                job.id,
                job.user_id,
                job.connection_id,
                job.provider.to_string(),
                job.sync_type.to_string(),
                job.status.to_string(),
                job.priority,
                job.progress,
                job.folders_completed,
                job.total_folders,
                job.messages_synced,
                job.current_folder,
                job.status_message,
                fmt_ts(job.started_at),
                job.completed_at.map(fmt_ts),
                job.latest_history_id,
                job.worker_id,
                job.retry_count,
                job.max_retries,
                fmt_ts(job.created_at),
                fmt_ts(job.updated_at),
                job.connection_id,
            ],
        )?;
        Ok(affected == 1)
    }

    pub fn find_active_job(&self, connection_id: &str) -> Result<Option<SyncJob>, DbError> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                "SELECT * FROM sync_jobs WHERE connection_id = ? AND status = 'in_progress' LIMIT 1",
                [connection_id],
                SyncJob::from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<SyncJob>, DbError> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                "SELECT * FROM sync_jobs WHERE id = ? LIMIT 1",
                [id],
                SyncJob::from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn get_job_for_user(&self, user_id: &str, id: &str) -> Result<Option<SyncJob>, DbError> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                "SELECT * FROM sync_jobs WHERE id = ? AND user_id = ? LIMIT 1",
                params![id, user_id],
                SyncJob::from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn get_job_status(&self, id: &str) -> Result<Option<JobStatus>, DbError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row("SELECT status FROM sync_jobs WHERE id = ?", [id], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|value| {
            value
                .parse::<JobStatus>()
                .map_err(DbError::Config)
        })
        .transpose()
    }

    /// Deterministic claim order: priority DESC, created_at ASC, id as the
    /// tie-breaker. The database is the queue.
    pub fn list_claimable_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM sync_jobs
            WHERE status = 'in_progress' AND worker_id IS NULL
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT ?
            "#,
        )?;
        let jobs = stmt
            .query_map([limit as i64], SyncJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn try_claim_job(&self, job_id: &str, worker_id: &str) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            r#"
            UPDATE sync_jobs
            SET worker_id = ?, updated_at = ?
            WHERE id = ? AND worker_id IS NULL AND status = 'in_progress'
            "#,
            params![worker_id, fmt_ts(Utc::now()), job_id],
        )?;
        Ok(affected == 1)
    }

    pub fn list_abandoned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<SyncJob>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM sync_jobs
            WHERE status = 'in_progress' AND worker_id IS NOT NULL AND updated_at < ?
            ORDER BY priority DESC, created_at ASC, id ASC
            "#,
        )?;
        let jobs = stmt
            .query_map([fmt_ts(cutoff)], SyncJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Scoped to the worker we observed as the holder, so two reclaimers
    /// racing for the same job cannot both win.
    pub fn try_reassign_job(
        &self,
        job_id: &str,
        from_worker: &str,
        to_worker: &str,
        note: &str,
    ) -> Result<bool, DbError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            r#"
            UPDATE sync_jobs
            SET worker_id = ?,
                status_message = TRIM(COALESCE(status_message, '') || ' ' || ?),
                updated_at = ?
            WHERE id = ? AND worker_id = ? AND status = 'in_progress'
            "#,
            params![to_worker, note, fmt_ts(Utc::now()), job_id, from_worker],
        )?;
        Ok(affected == 1)
    }

    pub fn update_job_progress(
        &self,
        job_id: &str,
        update: &ProgressUpdate,
    ) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE sync_jobs
            SET progress = COALESCE(?, progress),
                folders_completed = COALESCE(?, folders_completed),
                total_folders = COALESCE(?, total_folders),
                messages_synced = COALESCE(?, messages_synced),
                current_folder = COALESCE(?, current_folder),
                status_message = COALESCE(?, status_message),
                updated_at = ?
            WHERE id = ?
            "#,
            params![
                update.progress,
                update.folders_completed,
                update.total_folders,
                update.messages_synced,
                update.current_folder,
                update.status_message,
                fmt_ts(Utc::now()),
                job_id,
            ],
        )?;
        Ok(())
    }

    pub fn complete_job(
        &self,
        job_id: &str,
        messages_synced: Option<i64>,
        latest_history_id: Option<&str>,
        status_message: Option<&str>,
    ) -> Result<(), DbError> {
        let now = fmt_ts(Utc::now());
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE sync_jobs
            SET status = 'completed',
                progress = 100,
                messages_synced = COALESCE(?, messages_synced),
                latest_history_id = COALESCE(?, latest_history_id),
                status_message = COALESCE(?, status_message),
                completed_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
            params![
                messages_synced,
                latest_history_id,
                status_message,
                now,
                now,
                job_id
            ],
        )?;
        Ok(())
    }

    pub fn fail_job(&self, job_id: &str, reason: &str) -> Result<(), DbError> {
        let now = fmt_ts(Utc::now());
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE sync_jobs
            SET status = 'failed', status_message = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
            params![reason, now, now, job_id],
        )?;
        Ok(())
    }

    pub fn cancel_job(&self, user_id: &str, job_id: &str) -> Result<bool, DbError> {
        let now = fmt_ts(Utc::now());
        let conn = self.lock()?;
        let affected = conn.execute(
            r#"
            UPDATE sync_jobs
            SET status = 'cancelled', completed_at = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND status = 'in_progress'
            "#,
            params![now, now, job_id, user_id],
        )?;
        Ok(affected == 1)
    }

    /// Clear ownership but keep the job in_progress so another worker can
    /// reclaim it.
    pub fn release_jobs_for_worker(
        &self,
        worker_id: &str,
        note: Option<&str>,
    ) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let released = conn.execute(
            r#"
            UPDATE sync_jobs
            SET worker_id = NULL,
                status_message = CASE
                    WHEN ?1 IS NULL THEN status_message
                    ELSE TRIM(COALESCE(status_message, '') || ' ' || ?1)
                END,
                updated_at = ?2
            WHERE worker_id = ?3 AND status = 'in_progress'
            "#,
            params![note, fmt_ts(Utc::now()), worker_id],
        )?;
        Ok(released)
    }

    pub fn list_recent_jobs(&self, user_id: &str, limit: usize) -> Result<Vec<SyncJob>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM sync_jobs WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )?;
        let jobs = stmt
            .query_map(params![user_id, limit as i64], SyncJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn list_all_recent_jobs(&self, limit: usize) -> Result<Vec<SyncJob>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT * FROM sync_jobs ORDER BY created_at DESC, id DESC LIMIT ?")?;
        let jobs = stmt
            .query_map([limit as i64], SyncJob::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    // --- workers ---

    pub fn upsert_worker(&self, worker: &WorkerRecord) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sync_workers (
                worker_id, hostname, status, last_heartbeat, current_job_id,
                jobs_processed_count, started_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(worker_id) DO UPDATE SET
                hostname = excluded.hostname,
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                current_job_id = excluded.current_job_id,
                jobs_processed_count = excluded.jobs_processed_count,
                started_at = excluded.started_at
            "#,
            params![
                worker.worker_id,
                worker.hostname,
                worker.status.to_string(),
                fmt_ts(worker.last_heartbeat),
                worker.current_job_id,
                worker.jobs_processed_count,
                fmt_ts(worker.started_at),
            ],
        )?;
        Ok(())
    }

    pub fn heartbeat_worker(
        &self,
        worker_id: &str,
        jobs_processed_count: i64,
    ) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE sync_workers
            SET last_heartbeat = ?, jobs_processed_count = ?
            WHERE worker_id = ?
            "#,
            params![fmt_ts(Utc::now()), jobs_processed_count, worker_id],
        )?;
        Ok(())
    }

    pub fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_workers SET status = ? WHERE worker_id = ?",
            params![status.to_string(), worker_id],
        )?;
        Ok(())
    }

    pub fn set_worker_current_job(
        &self,
        worker_id: &str,
        job_id: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_workers SET current_job_id = ? WHERE worker_id = ?",
            params![job_id, worker_id],
        )?;
        Ok(())
    }

    pub fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, DbError> {
        let conn = self.lock()?;
        let worker = conn
            .query_row(
                "SELECT * FROM sync_workers WHERE worker_id = ? LIMIT 1",
                [worker_id],
                WorkerRecord::from_row,
            )
            .optional()?;
        Ok(worker)
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerRecord>, DbError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM sync_workers ORDER BY last_heartbeat DESC")?;
        let workers = stmt
            .query_map([], WorkerRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(workers)
    }

    /// Reaper step: flip silent active workers to inactive and return their
    /// ids so the caller can release their jobs.
    pub fn mark_stale_workers_inactive(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT worker_id FROM sync_workers
                WHERE status IN ('active', 'processing') AND last_heartbeat < ?
                "#,
            )?;
            let ids = stmt
                .query_map([fmt_ts(cutoff)], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };

        for worker_id in &stale {
            tx.execute(
                "UPDATE sync_workers SET status = 'inactive' WHERE worker_id = ?",
                [worker_id],
            )?;
        }

        tx.commit()?;
        Ok(stale)
    }

    // --- distributed locks ---

    /// Acquire by insert; a uniqueness violation means another replica holds
    /// the lock. Expired rows are reclaimed first so a crashed holder does
    /// not wedge the bucket forever.
    pub fn try_acquire_lock(&self, lock_id: &str, ttl: Duration) -> Result<bool, DbError> {
        let now = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM sync_locks WHERE id = ? AND expires_at < ?",
            params![lock_id, fmt_ts(now)],
        )?;
        let affected = conn.execute(
            "INSERT OR IGNORE INTO sync_locks (id, acquired_at, expires_at) VALUES (?, ?, ?)",
            params![lock_id, fmt_ts(now), fmt_ts(now + ttl)],
        )?;
        Ok(affected == 1)
    }

    pub fn release_lock(&self, lock_id: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sync_locks WHERE id = ?", [lock_id])?;
        Ok(())
    }

    pub fn get_lock(&self, lock_id: &str) -> Result<Option<SyncLock>, DbError> {
        let conn = self.lock()?;
        let lock = conn
            .query_row(
                "SELECT * FROM sync_locks WHERE id = ? LIMIT 1",
                [lock_id],
                SyncLock::from_row,
            )
            .optional()?;
        Ok(lock)
    }
}
