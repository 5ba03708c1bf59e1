use crate::db::models::Provider;
use crate::error::{SyncError, SyncResult};
use crate::providers::{
    HistoryPage, MessagePage, ProviderClient, ProviderLabel, ProviderMessage, ProviderProfile,
    TokenGrant, WatchSubscription,
};

/// Reserved Microsoft Graph variant. The contract matches Gmail's; the
/// implementation is pending, so every call reports the provider as
/// unsupported instead of half-working.
#[derive(Debug, Clone, Default)]
pub struct OutlookClient;

impl OutlookClient {
    pub fn new() -> Self {
        Self
    }

    fn unsupported<T>() -> SyncResult<T> {
        Err(SyncError::UnsupportedProvider(
            Provider::Outlook.to_string(),
        ))
    }
}

#[async_trait::async_trait]
impl ProviderClient for OutlookClient {
    fn provider(&self) -> Provider {
        Provider::Outlook
    }

    async fn profile(&self, _access_token: &str) -> SyncResult<ProviderProfile> {
        Self::unsupported()
    }

    async fn list_labels(&self, _access_token: &str) -> SyncResult<Vec<ProviderLabel>> {
        Self::unsupported()
    }

    async fn list_messages(
        &self,
        _access_token: &str,
        _provider_folder_id: &str,
        _page_size: i64,
        _page_token: Option<&str>,
    ) -> SyncResult<MessagePage> {
        Self::unsupported()
    }

    async fn get_message(
        &self,
        _access_token: &str,
        _message_id: &str,
    ) -> SyncResult<ProviderMessage> {
        Self::unsupported()
    }

    async fn list_history(
        &self,
        _access_token: &str,
        _start_history_id: &str,
        _page_token: Option<&str>,
    ) -> SyncResult<HistoryPage> {
        Self::unsupported()
    }

    async fn watch(&self, _access_token: &str, _topic: &str) -> SyncResult<WatchSubscription> {
        Self::unsupported()
    }

    async fn refresh_token(&self, _refresh_token: &str) -> SyncResult<TokenGrant> {
        Self::unsupported()
    }
}
