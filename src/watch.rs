use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::db::models::{EmailConnection, SyncType};
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::jobs::{JobQueue, PRIORITY_SCHEDULED};
use crate::providers::{HistoryMessage, ProviderRegistry};
use crate::sync::SyncEngine;
use crate::token::TokenManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Applied { new_messages: i64 },
    /// No usable cursor or the provider expired it; a full sync was
    /// enqueued instead.
    FullSyncEnqueued,
    /// Another task holds the connection. Push delivery is at-least-once
    /// and the regular incremental pass reconciles, so this is a no-op.
    Busy,
}

/// Installs provider push subscriptions and translates incoming change
/// notifications into incremental-sync work.
#[derive(Clone)]
pub struct WatchManager {
    db: Database,
    providers: Arc<ProviderRegistry>,
    tokens: TokenManager,
    queue: JobQueue,
    topic: String,
}

impl WatchManager {
    pub fn new(
        db: Database,
        providers: Arc<ProviderRegistry>,
        tokens: TokenManager,
        queue: JobQueue,
        topic: String,
    ) -> Self {
        Self {
            db,
            providers,
            tokens,
            queue,
            topic,
        }
    }

    /// Install (or renew — the provider treats them identically) the push
    /// subscription and persist its resource id, history id, and expiry.
    pub async fn install(&self, connection: &mut EmailConnection) -> SyncResult<()> {
        let token = self.tokens.ensure_fresh(connection).await?;
        let client = self.providers.by_provider(connection.provider)?;

        let subscription = client.watch(&token, &self.topic).await?;
        self.db.update_watch(
            &connection.id,
            subscription.resource_id.as_deref(),
            subscription.history_id.as_deref(),
            subscription.expiration,
        )?;

        connection.watch_resource_id = subscription.resource_id.clone();
        if subscription.history_id.is_some() {
            connection.watch_history_id = subscription.history_id.clone();
        }
        connection.watch_expiration = subscription.expiration;

        info!(
            connection = %connection.id,
            resource = subscription.resource_id.as_deref().unwrap_or("-"),
            "installed push watch"
        );
        Ok(())
    }

    pub async fn renew(&self, connection: &mut EmailConnection) -> SyncResult<()> {
        self.install(connection).await
    }

    /// Resolve the notification's resource id to a connection; unknown
    /// resources surface as ConnectionNotFound (the handler answers 404).
    pub async fn handle_notification(
        &self,
        resource_id: &str,
        received_history_id: &str,
    ) -> SyncResult<PushOutcome> {
        let Some(mut connection) = self.db.find_connection_by_watch_resource(resource_id)? else {
            return Err(SyncError::ConnectionNotFound(resource_id.to_string()));
        };
        self.process_history_update(&mut connection, received_history_id)
            .await
    }

    /// Sync from the stored watch cursor — the pushed history id is only
    /// advisory. The push path inserts messagesAdded carrying the INBOX
    /// label; full label and delete semantics belong to the regular
    /// incremental pass.
    pub async fn process_history_update(
        &self,
        connection: &mut EmailConnection,
        received_history_id: &str,
    ) -> SyncResult<PushOutcome> {
        let start_history_id = connection
            .watch_history_id
            .clone()
            .or_else(|| connection.latest_history_id.clone());
        let Some(start_history_id) = start_history_id else {
            return self.enqueue_full_fallback(connection).await;
        };

        let latch = match crate::sync::SyncLatch::acquire(&self.db, &connection.id) {
            Ok(latch) => latch,
            Err(SyncError::SyncInProgress(_)) => return Ok(PushOutcome::Busy),
            Err(error) => return Err(error),
        };

        let result = self
            .apply_push_delta(connection, &start_history_id, received_history_id)
            .await;
        latch.release()?;

        match result {
            Err(SyncError::InvalidHistoryCursor) => self.enqueue_full_fallback(connection).await,
            other => other,
        }
    }

    async fn apply_push_delta(
        &self,
        connection: &mut EmailConnection,
        start_history_id: &str,
        received_history_id: &str,
    ) -> SyncResult<PushOutcome> {
        let token = self.tokens.ensure_fresh(connection).await?;
        let client = self.providers.by_provider(connection.provider)?;

        let mut added: Vec<HistoryMessage> = Vec::new();
        let mut seen = HashSet::new();
        let mut final_history_id = start_history_id.to_string();
        let mut page_token: Option<String> = None;

        loop {
            let page = client
                .list_history(&token, start_history_id, page_token.as_deref())
                .await?;

            for record in page.records {
                for message in record.messages_added {
                    if message.label_ids.iter().any(|l| l == "INBOX")
                        && seen.insert(message.id.clone())
                    {
                        added.push(message);
                    }
                }
            }

            final_history_id = page.history_id;
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        let inbox_folder_id = self
            .db
            .find_folder_by_type(&connection.id, crate::db::models::FolderType::Inbox)?
            .map(|folder| folder.id);

        let mut new_messages = 0i64;
        for message in &added {
            match client.get_message(&token, &message.id).await {
                Ok(full) => {
                    let row = SyncEngine::build_cached_message(
                        connection,
                        &full,
                        inbox_folder_id.clone(),
                    );
                    self.db.upsert_message(&row)?;
                    new_messages += 1;
                }
                Err(error) => {
                    warn!(message = %message.id, %error, "push fetch failed");
                }
            }
        }

        // Monotonic advance: when two notifications race for the same
        // underlying change, the second write is a no-op.
        let advanced = self
            .db
            .advance_history_cursor(&connection.id, &final_history_id)?;
        if advanced {
            connection.latest_history_id = Some(final_history_id.clone());
            connection.watch_history_id = Some(final_history_id.clone());
        }

        info!(
            connection = %connection.id,
            received = received_history_id,
            applied = final_history_id.as_str(),
            new_messages,
            advanced,
            "processed push notification"
        );

        Ok(PushOutcome::Applied { new_messages })
    }

    async fn enqueue_full_fallback(
        &self,
        connection: &EmailConnection,
    ) -> SyncResult<PushOutcome> {
        match self
            .queue
            .enqueue(connection, SyncType::Full, PRIORITY_SCHEDULED)
        {
            Ok(job) => {
                info!(job = %job.id, connection = %connection.id, "push path enqueued full sync");
                Ok(PushOutcome::FullSyncEnqueued)
            }
            Err(SyncError::ConflictingJobInProgress(existing)) => {
                info!(existing = %existing, "full sync already pending for push fallback");
                Ok(PushOutcome::FullSyncEnqueued)
            }
            Err(error) => Err(error),
        }
    }
}
