use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::{AttachmentMeta, FolderType, Provider};
use crate::error::{SyncError, SyncResult};

pub mod backoff;
pub mod gmail;
pub mod outlook;

pub use gmail::GmailClient;
pub use outlook::OutlookClient;

#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub email: String,
    pub history_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderLabel {
    pub id: String,
    pub name: String,
    pub history_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageSummary {
    pub id: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessagePage {
    pub summaries: Vec<MessageSummary>,
    pub next_page_token: Option<String>,
}

/// A fully fetched, provider-neutral message: the wire decode and header
/// parsing happen inside the provider client so every sync path consumes
/// the same shape.
#[derive(Debug, Clone)]
pub struct ProviderMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub label_ids: Vec<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub date: Option<String>,
    pub body_html: Option<String>,
    pub body_preview: Option<String>,
    pub read: bool,
    pub starred: bool,
    pub attachments: Vec<AttachmentMeta>,
}

impl ProviderMessage {
    /// Default folder assignment from labels; unlabeled mail lands in
    /// archive.
    pub fn folder_type(&self) -> FolderType {
        if self.label_ids.iter().any(|l| l == "INBOX") {
            FolderType::Inbox
        } else if self.label_ids.iter().any(|l| l == "SENT") {
            FolderType::Sent
        } else if self.label_ids.iter().any(|l| l == "DRAFT" || l == "DRAFTS") {
            FolderType::Drafts
        } else if self.label_ids.iter().any(|l| l == "TRASH") {
            FolderType::Trash
        } else {
            FolderType::Archive
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryMessage {
    pub id: String,
    pub label_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryRecord {
    pub messages_added: Vec<HistoryMessage>,
    pub messages_deleted: Vec<String>,
    pub label_changes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    pub next_page_token: Option<String>,
    pub history_id: String,
}

#[derive(Debug, Clone)]
pub struct WatchSubscription {
    pub resource_id: Option<String>,
    pub history_id: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// One remote mail provider. Gmail is implemented; Outlook is reserved with
/// the same contract.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    async fn profile(&self, access_token: &str) -> SyncResult<ProviderProfile>;

    async fn list_labels(&self, access_token: &str) -> SyncResult<Vec<ProviderLabel>>;

    async fn list_messages(
        &self,
        access_token: &str,
        provider_folder_id: &str,
        page_size: i64,
        page_token: Option<&str>,
    ) -> SyncResult<MessagePage>;

    async fn get_message(&self, access_token: &str, message_id: &str)
        -> SyncResult<ProviderMessage>;

    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> SyncResult<HistoryPage>;

    async fn watch(&self, access_token: &str, topic: &str) -> SyncResult<WatchSubscription>;

    async fn refresh_token(&self, refresh_token: &str) -> SyncResult<TokenGrant>;
}

pub struct ProviderRegistry {
    clients: Vec<Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
        }
    }

    pub fn register(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.push(client);
    }

    pub fn by_provider(&self, provider: Provider) -> SyncResult<Arc<dyn ProviderClient>> {
        self.clients
            .iter()
            .find(|client| client.provider() == provider)
            .cloned()
            .ok_or_else(|| SyncError::UnsupportedProvider(provider.to_string()))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{
        HistoryPage, MessagePage, ProviderClient, ProviderLabel, ProviderMessage, ProviderProfile,
        ProviderRegistry, TokenGrant, WatchSubscription,
    };
    use crate::db::models::{FolderType, Provider};
    use crate::error::{SyncError, SyncResult};

    struct NullClient(Provider);

    #[async_trait]
    impl ProviderClient for NullClient {
        fn provider(&self) -> Provider {
            self.0
        }

        async fn profile(&self, _access_token: &str) -> SyncResult<ProviderProfile> {
            Err(SyncError::Provider("not implemented".into()))
        }

        async fn list_labels(&self, _access_token: &str) -> SyncResult<Vec<ProviderLabel>> {
            Ok(Vec::new())
        }

        async fn list_messages(
            &self,
            _access_token: &str,
            _provider_folder_id: &str,
            _page_size: i64,
            _page_token: Option<&str>,
        ) -> SyncResult<MessagePage> {
            Ok(MessagePage {
                summaries: Vec::new(),
                next_page_token: None,
            })
        }

        async fn get_message(
            &self,
            _access_token: &str,
            message_id: &str,
        ) -> SyncResult<ProviderMessage> {
            Err(SyncError::Provider(format!("no message {message_id}")))
        }

        async fn list_history(
            &self,
            _access_token: &str,
            _start_history_id: &str,
            _page_token: Option<&str>,
        ) -> SyncResult<HistoryPage> {
            Err(SyncError::InvalidHistoryCursor)
        }

        async fn watch(&self, _access_token: &str, _topic: &str) -> SyncResult<WatchSubscription> {
            Ok(WatchSubscription {
                resource_id: None,
                history_id: None,
                expiration: None,
            })
        }

        async fn refresh_token(&self, _refresh_token: &str) -> SyncResult<TokenGrant> {
            Err(SyncError::TokenRefreshTransient("offline".into()))
        }
    }

    #[test]
    fn registry_dispatches_by_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(NullClient(Provider::Gmail)));

        assert!(registry.by_provider(Provider::Gmail).is_ok());
        assert!(matches!(
            registry.by_provider(Provider::Outlook),
            Err(SyncError::UnsupportedProvider(_))
        ));
    }

    #[test]
    fn folder_type_precedence_follows_labels() {
        let mut message = ProviderMessage {
            id: "m1".into(),
            thread_id: None,
            label_ids: vec!["INBOX".into(), "STARRED".into()],
            subject: None,
            sender: None,
            recipients: vec![],
            cc: vec![],
            date: None,
            body_html: None,
            body_preview: None,
            read: false,
            starred: true,
            attachments: vec![],
        };
        assert_eq!(message.folder_type(), FolderType::Inbox);

        message.label_ids = vec!["SENT".into()];
        assert_eq!(message.folder_type(), FolderType::Sent);

        message.label_ids = vec!["SOME_USER_LABEL".into()];
        assert_eq!(message.folder_type(), FolderType::Archive);
    }
}
