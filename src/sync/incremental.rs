use std::collections::HashSet;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::db::models::{EmailConnection, SyncJob, SyncType};
use crate::error::{SyncError, SyncResult};
use crate::jobs::PRIORITY_SCHEDULED;
use crate::providers::HistoryRecord;
use crate::sync::{SyncEngine, SyncLatch};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalStats {
    pub new_messages: i64,
    pub deleted_messages: i64,
    pub updated_messages: i64,
    pub errors: i64,
    pub latest_history_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementalOutcome {
    Applied(IncrementalStats),
    /// The cursor is missing or the provider no longer honors it; the
    /// caller enqueues a full sync.
    RequiresFullSync,
}

/// Disjoint change sets with precedence add > delete > update: every
/// message id lands in exactly one set no matter how many history records
/// mention it.
pub(crate) fn partition_history(
    records: &[HistoryRecord],
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut to_add = Vec::new();
    let mut add_set = HashSet::new();
    for record in records {
        for added in &record.messages_added {
            if add_set.insert(added.id.clone()) {
                to_add.push(added.id.clone());
            }
        }
    }

    let mut to_delete = Vec::new();
    let mut delete_set = HashSet::new();
    for record in records {
        for deleted in &record.messages_deleted {
            if !add_set.contains(deleted) && delete_set.insert(deleted.clone()) {
                to_delete.push(deleted.clone());
            }
        }
    }

    let mut to_update = Vec::new();
    let mut update_set = HashSet::new();
    for record in records {
        for changed in &record.label_changes {
            if !add_set.contains(changed)
                && !delete_set.contains(changed)
                && update_set.insert(changed.clone())
            {
                to_update.push(changed.clone());
            }
        }
    }

    (to_add, to_delete, to_update)
}

impl SyncEngine {
    /// IncrementalSync driven by a claimed job. RequiresFullSync completes
    /// the job and enqueues the full rebuild in its place.
    pub async fn run_incremental_job(&self, job: &SyncJob) -> SyncResult<IncrementalOutcome> {
        debug_assert_eq!(job.sync_type, SyncType::Incremental);

        let mut connection = self
            .db
            .get_connection(&job.connection_id)?
            .ok_or_else(|| SyncError::ConnectionNotFound(job.connection_id.clone()))?;

        let outcome = self
            .run_incremental_inner(&mut connection, Some(job))
            .await?;

        match &outcome {
            IncrementalOutcome::Applied(stats) => {
                self.queue.complete(
                    &job.id,
                    Some(stats.new_messages + stats.updated_messages),
                    stats.latest_history_id.as_deref(),
                    None,
                )?;
            }
            IncrementalOutcome::RequiresFullSync => {
                self.queue.complete(
                    &job.id,
                    None,
                    None,
                    Some("history cursor unusable; full sync enqueued"),
                )?;
                match self.queue.enqueue(&connection, SyncType::Full, PRIORITY_SCHEDULED) {
                    Ok(full_job) => {
                        info!(job = %full_job.id, connection = %connection.id, "enqueued fallback full sync")
                    }
                    Err(SyncError::ConflictingJobInProgress(existing)) => {
                        info!(existing = %existing, "fallback full sync already queued")
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        Ok(outcome)
    }

    /// Direct-run entry used by the synchronous API path and the webhook.
    pub async fn run_incremental(
        &self,
        connection: &mut EmailConnection,
    ) -> SyncResult<IncrementalOutcome> {
        self.run_incremental_inner(connection, None).await
    }

    async fn run_incremental_inner(
        &self,
        connection: &mut EmailConnection,
        job: Option<&SyncJob>,
    ) -> SyncResult<IncrementalOutcome> {
        let Some(start_history_id) = connection.latest_history_id.clone() else {
            return Ok(IncrementalOutcome::RequiresFullSync);
        };

        let latch = SyncLatch::acquire(&self.db, &connection.id)?;
        let result = self
            .apply_history_since(connection, &start_history_id, job)
            .await;
        latch.release()?;
        result
    }

    async fn apply_history_since(
        &self,
        connection: &mut EmailConnection,
        start_history_id: &str,
        job: Option<&SyncJob>,
    ) -> SyncResult<IncrementalOutcome> {
        let job_id = job.map(|job| job.id.as_str());
        let token = self.tokens.ensure_fresh(connection).await?;
        let client = self.providers.by_provider(connection.provider)?;

        // Collect the whole delta first; the final page carries the cursor
        // the next sync resumes from.
        let mut records = Vec::new();
        let mut final_history_id = start_history_id.to_string();
        let mut page_token: Option<String> = None;

        loop {
            let page = match client
                .list_history(&token, start_history_id, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(SyncError::InvalidHistoryCursor) => {
                    return Ok(IncrementalOutcome::RequiresFullSync)
                }
                Err(error) => return Err(error),
            };

            records.extend(page.records);
            final_history_id = page.history_id;
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        let (to_add, to_delete, to_update) = partition_history(&records);
        let mut stats = IncrementalStats::default();

        self.ensure_folders(connection)?;

        // adds: fetch in batches, cache one-by-one so a bad message is
        // counted, not fatal
        stats.new_messages = self
            .fetch_and_cache(connection, &token, &to_add, &mut stats.errors, job_id)
            .await?;

        for chunk in to_delete.chunks(self.options.delete_batch_size) {
            self.check_cancelled(job_id)?;
            let deleted = self
                .db
                .delete_messages_by_provider_ids(&connection.id, chunk)?;
            stats.deleted_messages += deleted as i64;
        }

        // updates re-fetch and upsert; the single write contract makes the
        // overwrite safe
        stats.updated_messages = self
            .fetch_and_cache(connection, &token, &to_update, &mut stats.errors, job_id)
            .await?;

        let advanced = self
            .db
            .advance_history_cursor(&connection.id, &final_history_id)?;
        if advanced {
            connection.latest_history_id = Some(final_history_id.clone());
            connection.watch_history_id = Some(final_history_id.clone());
        }
        self.db.touch_last_synced(&connection.id)?;
        stats.latest_history_id = Some(final_history_id);

        info!(
            connection = %connection.id,
            added = stats.new_messages,
            deleted = stats.deleted_messages,
            updated = stats.updated_messages,
            errors = stats.errors,
            "incremental sync applied"
        );

        Ok(IncrementalOutcome::Applied(stats))
    }

    async fn fetch_and_cache(
        &self,
        connection: &EmailConnection,
        token: &str,
        message_ids: &[String],
        errors: &mut i64,
        job_id: Option<&str>,
    ) -> SyncResult<i64> {
        let client = self.providers.by_provider(connection.provider)?;
        let mut cached = 0i64;

        for chunk in message_ids.chunks(self.options.fetch_batch_size) {
            self.check_cancelled(job_id)?;

            for message_id in chunk {
                let message = match client.get_message(token, message_id).await {
                    Ok(message) => message,
                    Err(
                        error @ (SyncError::RateLimitExceeded { .. }
                        | SyncError::TokenRevoked(_)),
                    ) => return Err(error),
                    Err(error) => {
                        warn!(message = %message_id, %error, "incremental fetch failed");
                        *errors += 1;
                        continue;
                    }
                };

                let folder_id = self
                    .db
                    .find_folder_by_type(&connection.id, message.folder_type())?
                    .map(|folder| folder.id);
                let row = Self::build_cached_message(connection, &message, folder_id);
                match self.db.upsert_message(&row) {
                    Ok(()) => cached += 1,
                    Err(error) => {
                        warn!(message = %message_id, %error, "incremental cache write failed");
                        *errors += 1;
                    }
                }
            }

            sleep(self.options.page_delay).await;
        }

        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::partition_history;
    use crate::providers::{HistoryMessage, HistoryRecord};

    fn added(id: &str) -> HistoryMessage {
        HistoryMessage {
            id: id.to_string(),
            label_ids: vec!["INBOX".to_string()],
        }
    }

    #[test]
    fn partition_applies_add_delete_update_precedence() {
        let records = vec![
            HistoryRecord {
                messages_added: vec![added("a"), added("b")],
                messages_deleted: vec!["b".to_string(), "c".to_string()],
                label_changes: vec!["a".to_string(), "c".to_string(), "d".to_string()],
            },
            HistoryRecord {
                messages_added: vec![added("a")],
                messages_deleted: vec!["c".to_string()],
                label_changes: vec!["d".to_string(), "e".to_string()],
            },
        ];

        let (to_add, to_delete, to_update) = partition_history(&records);

        // b was added then deleted in the same range: add wins
        assert_eq!(to_add, vec!["a".to_string(), "b".to_string()]);
        // c deleted, also label-changed: delete wins
        assert_eq!(to_delete, vec!["c".to_string()]);
        // only ids seen in neither add nor delete remain updates
        assert_eq!(to_update, vec!["d".to_string(), "e".to_string()]);
    }

    #[test]
    fn partition_of_empty_history_is_empty() {
        let (to_add, to_delete, to_update) = partition_history(&[]);
        assert!(to_add.is_empty());
        assert!(to_delete.is_empty());
        assert!(to_update.is_empty());
    }
}
