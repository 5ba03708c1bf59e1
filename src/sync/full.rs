use tokio::time::sleep;
use tracing::{info, warn};

use crate::db::models::{EmailConnection, Folder, SyncJob, SyncStatus, SyncType};
use crate::db::ProgressUpdate;
use crate::error::{SyncError, SyncResult};
use crate::sync::{FullSyncStats, SyncEngine, SyncLatch, PROVIDER_MAX_PAGE_SIZE};

impl SyncEngine {
    /// FullSync: prepare → refresh_token → discover_folders →
    /// [per folder: clear → page_loop] → finalize. Folder failures are
    /// best-effort; revocation, rate-limit exhaustion, and cancellation
    /// abort the job.
    pub async fn run_full(&self, job: &SyncJob) -> SyncResult<FullSyncStats> {
        debug_assert_eq!(job.sync_type, SyncType::Full);

        let mut connection = self
            .db
            .get_connection(&job.connection_id)?
            .ok_or_else(|| SyncError::ConnectionNotFound(job.connection_id.clone()))?;

        let latch = SyncLatch::acquire(&self.db, &connection.id)?;
        self.db
            .set_connection_sync_status(&connection.id, SyncStatus::Syncing)?;

        let result = self.run_full_inner(&mut connection, job).await;

        match &result {
            Ok(stats) => {
                self.db.finalize_connection_sync(
                    &connection.id,
                    stats.latest_history_id.as_deref(),
                )?;
                let status_message = if stats.folders_failed > 0 {
                    Some(format!(
                        "completed with {} of {} folders failed",
                        stats.folders_failed,
                        stats.folders_completed + stats.folders_failed
                    ))
                } else {
                    None
                };
                self.queue.complete(
                    &job.id,
                    Some(stats.messages_synced),
                    stats.latest_history_id.as_deref(),
                    status_message.as_deref(),
                )?;
                latch.release()?;
                info!(
                    job = %job.id,
                    connection = %connection.id,
                    messages = stats.messages_synced,
                    folders = stats.folders_completed,
                    "full sync completed"
                );
            }
            Err(SyncError::Cancelled) => {
                // committed writes stay; the job row is already cancelled
                self.db
                    .set_connection_sync_status(&connection.id, SyncStatus::Idle)?;
                latch.release()?;
            }
            Err(SyncError::TokenRevoked(_)) | Err(SyncError::TokenRefreshTransient(_)) => {
                // TokenManager already wrote the connection status
                latch.release()?;
            }
            Err(error) => {
                self.db
                    .set_connection_sync_error(&connection.id, &error.to_string())?;
                latch.release()?;
            }
        }

        result
    }

    async fn run_full_inner(
        &self,
        connection: &mut EmailConnection,
        job: &SyncJob,
    ) -> SyncResult<FullSyncStats> {
        // Always refresh up front, even on a live token, to surface silent
        // revocation before any cache mutation.
        let token = self.tokens.refresh(connection).await?;
        let client = self.providers.by_provider(connection.provider)?;

        // Folder discovery also captures the history cursor the first
        // incremental sync will resume from.
        let labels = client.list_labels(&token).await?;
        let latest_history_id = labels
            .iter()
            .find(|label| label.id == "INBOX")
            .and_then(|label| label.history_id.clone())
            .or_else(|| labels.iter().find_map(|label| label.history_id.clone()));
        let latest_history_id = match latest_history_id {
            Some(cursor) => Some(cursor),
            None => client.profile(&token).await?.history_id,
        };

        let folders = self.ensure_folders(connection)?;

        if job.total_folders != folders.len() as i64 {
            self.report(job, ProgressUpdate {
                total_folders: Some(folders.len() as i64),
                ..ProgressUpdate::default()
            });
        }

        let mut stats = FullSyncStats {
            latest_history_id,
            ..FullSyncStats::default()
        };
        let total_folders = folders.len() as i64;

        for folder in &folders {
            self.check_cancelled(Some(&job.id))?;
            self.report(job, ProgressUpdate {
                current_folder: Some(folder.name.clone()),
                status_message: Some(format!("syncing folder {}", folder.name)),
                ..ProgressUpdate::default()
            });

            match self.sync_folder(connection, job, folder, &mut stats).await {
                Ok(()) => {
                    stats.folders_completed += 1;
                    let progress = if total_folders > 0 {
                        (100.0 * stats.folders_completed as f64 / total_folders as f64).round()
                            as i64
                    } else {
                        100
                    };
                    self.report(job, ProgressUpdate {
                        progress: Some(progress),
                        folders_completed: Some(stats.folders_completed),
                        messages_synced: Some(stats.messages_synced),
                        ..ProgressUpdate::default()
                    });
                }
                Err(
                    error @ (SyncError::Cancelled
                    | SyncError::TokenRevoked(_)
                    | SyncError::TokenRefreshTransient(_)
                    | SyncError::RateLimitExceeded { .. }),
                ) => return Err(error),
                Err(error) => {
                    // best-effort: one bad folder must not block the rest
                    warn!(
                        job = %job.id,
                        folder = %folder.name,
                        %error,
                        "folder sync failed, continuing"
                    );
                    stats.folders_failed += 1;
                    self.report(job, ProgressUpdate {
                        status_message: Some(format!("folder {} failed: {error}", folder.name)),
                        ..ProgressUpdate::default()
                    });
                }
            }
        }

        Ok(stats)
    }

    /// One folder: pre-clear the cache, then page through the provider,
    /// fetching each summary in full and upserting in sub-batches.
    async fn sync_folder(
        &self,
        connection: &mut EmailConnection,
        job: &SyncJob,
        folder: &Folder,
        stats: &mut FullSyncStats,
    ) -> SyncResult<()> {
        let client = self.providers.by_provider(connection.provider)?;

        // Pre-clear tolerates reclamation: a rerun of this folder starts
        // from scratch and converges to the same cache.
        self.db
            .delete_folder_messages(&connection.user_id, &connection.id, &folder.id)?;

        let page_size = connection.sync_batch_size.clamp(1, PROVIDER_MAX_PAGE_SIZE);
        let mut page_token: Option<String> = None;

        loop {
            self.check_cancelled(Some(&job.id))?;
            let token = self.tokens.ensure_fresh(connection).await?;

            let page = client
                .list_messages(
                    &token,
                    &folder.provider_folder_id,
                    page_size,
                    page_token.as_deref(),
                )
                .await?;

            let mut fetched = Vec::with_capacity(page.summaries.len());
            for summary in &page.summaries {
                match client.get_message(&token, &summary.id).await {
                    Ok(message) => fetched.push(message),
                    Err(
                        error @ (SyncError::RateLimitExceeded { .. }
                        | SyncError::TokenRevoked(_)),
                    ) => return Err(error),
                    Err(error) => {
                        warn!(message = %summary.id, %error, "message fetch failed");
                        stats.message_errors += 1;
                    }
                }
            }

            for chunk in fetched.chunks(self.options.upsert_batch_size) {
                self.check_cancelled(Some(&job.id))?;
                let batch: Vec<_> = chunk
                    .iter()
                    .map(|message| {
                        Self::build_cached_message(connection, message, Some(folder.id.clone()))
                    })
                    .collect();
                self.db.upsert_messages(&batch)?;
                stats.messages_synced += batch.len() as i64;
                sleep(self.options.batch_delay).await;
            }

            self.report(job, ProgressUpdate {
                messages_synced: Some(stats.messages_synced),
                status_message: Some(format!(
                    "synced {} messages ({})",
                    stats.messages_synced, folder.name
                )),
                ..ProgressUpdate::default()
            });

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
            sleep(self.options.page_delay).await;
        }

        Ok(())
    }

    /// Single-folder refresh for the on-demand API. The folder row is
    /// resolved by type and the optional pre-clear deletes by its id.
    pub async fn run_folder_refresh(
        &self,
        connection: &mut EmailConnection,
        folder_type: crate::db::models::FolderType,
        pre_clear: bool,
    ) -> SyncResult<i64> {
        let latch = SyncLatch::acquire(&self.db, &connection.id)?;
        let result = self
            .run_folder_refresh_inner(connection, folder_type, pre_clear)
            .await;
        latch.release()?;
        result
    }

    async fn run_folder_refresh_inner(
        &self,
        connection: &mut EmailConnection,
        folder_type: crate::db::models::FolderType,
        pre_clear: bool,
    ) -> SyncResult<i64> {
        let client = self.providers.by_provider(connection.provider)?;
        self.ensure_folders(connection)?;
        let folder = self
            .db
            .find_folder_by_type(&connection.id, folder_type)?
            .ok_or_else(|| SyncError::FolderNotFound(folder_type.to_string()))?;

        if pre_clear {
            self.db
                .delete_folder_messages(&connection.user_id, &connection.id, &folder.id)?;
        }

        let page_size = connection.sync_batch_size.clamp(1, PROVIDER_MAX_PAGE_SIZE);
        let mut page_token: Option<String> = None;
        let mut synced = 0i64;

        loop {
            let token = self.tokens.ensure_fresh(connection).await?;
            let page = client
                .list_messages(
                    &token,
                    &folder.provider_folder_id,
                    page_size,
                    page_token.as_deref(),
                )
                .await?;

            let mut batch = Vec::with_capacity(page.summaries.len());
            for summary in &page.summaries {
                let message = client.get_message(&token, &summary.id).await?;
                batch.push(Self::build_cached_message(
                    connection,
                    &message,
                    Some(folder.id.clone()),
                ));
            }
            self.db.upsert_messages(&batch)?;
            synced += batch.len() as i64;

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
            sleep(self.options.page_delay).await;
        }

        Ok(synced)
    }

    fn report(&self, job: &SyncJob, update: ProgressUpdate) {
        // progress failures are logged, never fatal
        if let Err(error) = self.queue.report_progress(&job.id, update) {
            warn!(job = %job.id, %error, "progress update failed");
        }
    }
}
