#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use mailsync::db::models::{EmailConnection, Provider, SyncStatus};
use mailsync::db::Database;
use mailsync::error::{SyncError, SyncResult};
use mailsync::jobs::JobQueue;
use mailsync::providers::{
    HistoryPage, HistoryRecord, MessagePage, MessageSummary, ProviderClient, ProviderLabel,
    ProviderMessage, ProviderProfile, ProviderRegistry, TokenGrant, WatchSubscription,
};
use mailsync::sync::{SyncEngine, SyncOptions};
use mailsync::token::TokenManager;
use mailsync::watch::WatchManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshBehavior {
    Grant,
    Revoked,
    Transient,
}

/// Scriptable in-memory Gmail stand-in: folders map label ids to message
/// ids, history returns a fixed delta until the cursor catches up.
pub struct MockState {
    pub profile_email: String,
    pub history_id: String,
    pub folder_messages: HashMap<String, Vec<String>>,
    pub messages: HashMap<String, ProviderMessage>,
    pub history: Vec<HistoryRecord>,
    pub invalid_cursor: bool,
    pub refresh_behavior: RefreshBehavior,
    pub watch_resource: Option<String>,
    pub page_size_limit: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            profile_email: "owner@gmail.com".to_string(),
            history_id: "1000".to_string(),
            folder_messages: HashMap::new(),
            messages: HashMap::new(),
            history: Vec::new(),
            invalid_cursor: false,
            refresh_behavior: RefreshBehavior::Grant,
            watch_resource: Some("watch-res-1".to_string()),
            page_size_limit: 100,
        }
    }
}

pub struct MockProvider {
    pub state: Arc<Mutex<MockState>>,
    pub refresh_calls: AtomicU32,
    pub message_fetches: AtomicU32,
}

impl MockProvider {
    pub fn new(state: MockState) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(state)),
            refresh_calls: AtomicU32::new(0),
            message_fetches: AtomicU32::new(0),
        })
    }
}

pub fn provider_message(id: &str, labels: &[&str], subject: &str) -> ProviderMessage {
    ProviderMessage {
        id: id.to_string(),
        thread_id: Some(format!("thread-{id}")),
        label_ids: labels.iter().map(|l| l.to_string()).collect(),
        subject: Some(subject.to_string()),
        sender: Some("sender@example.com".to_string()),
        recipients: vec!["owner@gmail.com".to_string()],
        cc: vec![],
        date: Some("2026-02-01T09:00:00+00:00".to_string()),
        body_html: None,
        body_preview: Some(format!("preview of {subject}")),
        read: false,
        starred: false,
        attachments: vec![],
    }
}

#[async_trait::async_trait]
impl ProviderClient for MockProvider {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    async fn profile(&self, _access_token: &str) -> SyncResult<ProviderProfile> {
        let state = self.state.lock().expect("mock state");
        Ok(ProviderProfile {
            email: state.profile_email.clone(),
            history_id: Some(state.history_id.clone()),
        })
    }

    async fn list_labels(&self, _access_token: &str) -> SyncResult<Vec<ProviderLabel>> {
        let state = self.state.lock().expect("mock state");
        Ok(vec![
            ProviderLabel {
                id: "INBOX".to_string(),
                name: "INBOX".to_string(),
                history_id: Some(state.history_id.clone()),
            },
            ProviderLabel {
                id: "SENT".to_string(),
                name: "SENT".to_string(),
                history_id: None,
            },
            ProviderLabel {
                id: "DRAFT".to_string(),
                name: "DRAFT".to_string(),
                history_id: None,
            },
            ProviderLabel {
                id: "TRASH".to_string(),
                name: "TRASH".to_string(),
                history_id: None,
            },
        ])
    }

    async fn list_messages(
        &self,
        _access_token: &str,
        provider_folder_id: &str,
        page_size: i64,
        page_token: Option<&str>,
    ) -> SyncResult<MessagePage> {
        let state = self.state.lock().expect("mock state");
        let ids = state
            .folder_messages
            .get(provider_folder_id)
            .cloned()
            .unwrap_or_default();

        let offset: usize = page_token
            .map(|token| token.parse().unwrap_or(0))
            .unwrap_or(0);
        let limit = (page_size as usize).min(state.page_size_limit);
        let page: Vec<MessageSummary> = ids
            .iter()
            .skip(offset)
            .take(limit)
            .map(|id| MessageSummary {
                id: id.clone(),
                thread_id: Some(format!("thread-{id}")),
            })
            .collect();

        let next_offset = offset + page.len();
        let next_page_token = if next_offset < ids.len() {
            Some(next_offset.to_string())
        } else {
            None
        };

        Ok(MessagePage {
            summaries: page,
            next_page_token,
        })
    }

    async fn get_message(
        &self,
        _access_token: &str,
        message_id: &str,
    ) -> SyncResult<ProviderMessage> {
        self.message_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().expect("mock state");
        state
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| SyncError::Provider(format!("status=404 message {message_id}")))
    }

    async fn list_history(
        &self,
        _access_token: &str,
        start_history_id: &str,
        _page_token: Option<&str>,
    ) -> SyncResult<HistoryPage> {
        let state = self.state.lock().expect("mock state");
        if state.invalid_cursor {
            return Err(SyncError::InvalidHistoryCursor);
        }

        // a caught-up cursor sees an empty delta
        let records = if start_history_id == state.history_id {
            Vec::new()
        } else {
            state.history.clone()
        };

        Ok(HistoryPage {
            records,
            next_page_token: None,
            history_id: state.history_id.clone(),
        })
    }

    async fn watch(&self, _access_token: &str, _topic: &str) -> SyncResult<WatchSubscription> {
        let state = self.state.lock().expect("mock state");
        Ok(WatchSubscription {
            resource_id: state.watch_resource.clone(),
            history_id: Some(state.history_id.clone()),
            expiration: Some(Utc::now() + chrono::Duration::days(7)),
        })
    }

    async fn refresh_token(&self, _refresh_token: &str) -> SyncResult<TokenGrant> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().expect("mock state");
        match state.refresh_behavior {
            RefreshBehavior::Grant => Ok(TokenGrant {
                access_token: "mock-access".to_string(),
                refresh_token: None,
                expires_at: Utc::now() + chrono::Duration::hours(1),
            }),
            RefreshBehavior::Revoked => {
                Err(SyncError::TokenRevoked("invalid_grant: Token has been revoked".to_string()))
            }
            RefreshBehavior::Transient => {
                Err(SyncError::TokenRefreshTransient("status=503 unavailable".to_string()))
            }
        }
    }
}

pub struct TestHarness {
    pub db: Database,
    pub db_path: PathBuf,
    pub queue: JobQueue,
    pub engine: SyncEngine,
    pub watches: WatchManager,
    pub provider: Arc<MockProvider>,
}

impl TestHarness {
    pub fn new(state: MockState) -> Self {
        let db_path =
            std::env::temp_dir().join(format!("mailsync-it-{}.db", Uuid::new_v4()));
        let db = Database::open(&db_path).expect("open test db");

        let provider = MockProvider::new(state);
        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());
        let providers = Arc::new(registry);

        let queue = JobQueue::new(db.clone());
        let tokens = TokenManager::new(db.clone(), providers.clone());
        let engine = SyncEngine::new(db.clone(), providers.clone(), tokens.clone(), queue.clone())
            .with_options(SyncOptions {
                page_delay: Duration::from_millis(0),
                batch_delay: Duration::from_millis(0),
                ..SyncOptions::default()
            });
        let watches = WatchManager::new(
            db.clone(),
            providers,
            tokens,
            queue.clone(),
            "projects/test/topics/mail".to_string(),
        );

        Self {
            db,
            db_path,
            queue,
            engine,
            watches,
            provider,
        }
    }

    pub fn insert_connection(&self, latest_history_id: Option<&str>) -> EmailConnection {
        self.db
            .upsert_connection(&EmailConnection {
                id: Uuid::new_v4().to_string(),
                user_id: "user-1".to_string(),
                provider: Provider::Gmail,
                email: "owner@gmail.com".to_string(),
                access_token: "access-initial".to_string(),
                refresh_token: "refresh-initial".to_string(),
                token_expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                latest_history_id: latest_history_id.map(str::to_string),
                last_synced_at: None,
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
            .expect("insert test connection")
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}
