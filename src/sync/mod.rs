use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::db::models::{CachedMessage, EmailConnection, Folder, FolderType};
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::jobs::JobQueue;
use crate::providers::{ProviderMessage, ProviderRegistry};
use crate::token::TokenManager;

mod full;
mod incremental;

pub use incremental::{IncrementalOutcome, IncrementalStats};

pub const PROVIDER_MAX_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    /// Cache upsert sub-batch size within a page.
    pub upsert_batch_size: usize,
    /// Full-message fetch batch size during incremental apply.
    pub fetch_batch_size: usize,
    /// Provider-id delete batch size during incremental apply.
    pub delete_batch_size: usize,
    /// Pause between provider pages.
    pub page_delay: Duration,
    /// Pause between cache sub-batches.
    pub batch_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            upsert_batch_size: 50,
            fetch_batch_size: 20,
            delete_batch_size: 100,
            page_delay: Duration::from_millis(500),
            batch_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FullSyncStats {
    pub folders_completed: i64,
    pub folders_failed: i64,
    pub messages_synced: i64,
    pub message_errors: i64,
    pub latest_history_id: Option<String>,
}

/// Drives the FullSync and IncrementalSync state machines against the
/// ProviderClient, TokenManager, and Store.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) db: Database,
    pub(crate) providers: Arc<ProviderRegistry>,
    pub(crate) tokens: TokenManager,
    pub(crate) queue: JobQueue,
    pub(crate) options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        providers: Arc<ProviderRegistry>,
        tokens: TokenManager,
        queue: JobQueue,
    ) -> Self {
        Self {
            db,
            providers,
            tokens,
            queue,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Folder rows are the unit FullSync iterates; seed the four defaults on
    /// first contact with a mailbox, then re-read so every caller sees the
    /// same rows.
    pub(crate) fn ensure_folders(&self, connection: &EmailConnection) -> SyncResult<Vec<Folder>> {
        let existing = self.db.list_folders(&connection.id)?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        for (name, folder_type, provider_folder_id) in DEFAULT_FOLDER_SEED {
            self.db.insert_folder(&Folder {
                id: Uuid::new_v4().to_string(),
                user_id: connection.user_id.clone(),
                connection_id: connection.id.clone(),
                name: name.to_string(),
                folder_type,
                provider_folder_id: provider_folder_id.to_string(),
            })?;
        }

        Ok(self.db.list_folders(&connection.id)?)
    }

    pub(crate) fn build_cached_message(
        connection: &EmailConnection,
        message: &ProviderMessage,
        folder_id: Option<String>,
    ) -> CachedMessage {
        CachedMessage {
            id: Uuid::new_v4().to_string(),
            user_id: connection.user_id.clone(),
            connection_id: connection.id.clone(),
            provider_email_id: message.id.clone(),
            folder_id,
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            recipients: message.recipients.clone(),
            cc: message.cc.clone(),
            date: message.date.clone(),
            body_html: message.body_html.clone(),
            body_preview: message.body_preview.clone(),
            read: message.read,
            starred: message.starred,
            attachments: message.attachments.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Workers observe cancellation at progress checkpoints and exit
    /// cleanly, leaving committed writes in place.
    pub(crate) fn check_cancelled(&self, job_id: Option<&str>) -> SyncResult<()> {
        if let Some(job_id) = job_id {
            if self.queue.is_cancelled(job_id)? {
                return Err(SyncError::Cancelled);
            }
        }
        Ok(())
    }
}

// Gmail system label ids; an Outlook seed will map well-known folder names
// when that client lands.
const DEFAULT_FOLDER_SEED: [(&str, FolderType, &str); 4] = [
    ("Inbox", FolderType::Inbox, "INBOX"),
    ("Sent", FolderType::Sent, "SENT"),
    ("Drafts", FolderType::Drafts, "DRAFT"),
    ("Trash", FolderType::Trash, "TRASH"),
];

/// Per-connection mutual exclusion. Acquire flips sync_in_progress with a
/// conditional update; the guard resets it on every exit path, including
/// panics and early returns.
pub(crate) struct SyncLatch {
    db: Database,
    connection_id: String,
    armed: bool,
}

impl SyncLatch {
    pub fn acquire(db: &Database, connection_id: &str) -> SyncResult<Self> {
        if !db.try_begin_connection_sync(connection_id)? {
            return Err(SyncError::SyncInProgress(connection_id.to_string()));
        }
        Ok(Self {
            db: db.clone(),
            connection_id: connection_id.to_string(),
            armed: true,
        })
    }

    pub fn release(mut self) -> SyncResult<()> {
        self.armed = false;
        Ok(self.db.end_connection_sync(&self.connection_id)?)
    }
}

impl Drop for SyncLatch {
    fn drop(&mut self) {
        if self.armed {
            if let Err(error) = self.db.end_connection_sync(&self.connection_id) {
                warn!(
                    connection = %self.connection_id,
                    %error,
                    "failed to clear sync_in_progress latch"
                );
            }
        }
    }
}
