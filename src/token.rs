use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::db::models::EmailConnection;
use crate::db::Database;
use crate::error::{SyncError, SyncResult};
use crate::providers::ProviderRegistry;

const EXPIRY_SKEW_SECONDS: i64 = 300;

/// Wraps ProviderClient token refresh and keeps the connection row current.
/// Classifies refresh failures into irrevocable revocation (requires user
/// reconnect) versus transient failures (retry next cycle).
#[derive(Clone)]
pub struct TokenManager {
    db: Database,
    providers: Arc<ProviderRegistry>,
    skew: Duration,
}

impl TokenManager {
    pub fn new(db: Database, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            db,
            providers,
            skew: Duration::seconds(EXPIRY_SKEW_SECONDS),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    /// No-op while the stored token is comfortably inside its lifetime.
    pub async fn ensure_fresh(&self, connection: &mut EmailConnection) -> SyncResult<String> {
        if let Some(expires_at) = connection.token_expires_at {
            if expires_at > Utc::now() + self.skew {
                return Ok(connection.access_token.clone());
            }
        }
        self.refresh(connection).await
    }

    /// Unconditional refresh. Syncs call this once up front regardless of
    /// expiry to catch silently revoked tokens before doing any work.
    pub async fn refresh(&self, connection: &mut EmailConnection) -> SyncResult<String> {
        let client = self.providers.by_provider(connection.provider)?;

        match client.refresh_token(&connection.refresh_token).await {
            Ok(grant) => {
                // A rotated refresh token replaces the stored one; persist
                // before returning so a crash cannot lose the rotation.
                let refresh_token = grant
                    .refresh_token
                    .unwrap_or_else(|| connection.refresh_token.clone());
                self.db.update_connection_tokens(
                    &connection.id,
                    &grant.access_token,
                    &refresh_token,
                    grant.expires_at,
                )?;

                connection.access_token = grant.access_token.clone();
                connection.refresh_token = refresh_token;
                connection.token_expires_at = Some(grant.expires_at);

                info!(connection = %connection.id, "refreshed provider access token");
                Ok(grant.access_token)
            }
            Err(SyncError::TokenRevoked(reason)) => {
                warn!(connection = %connection.id, %reason, "refresh token revoked");
                self.db
                    .mark_connection_requires_reauth(&connection.id, &reason)?;
                Err(SyncError::TokenRevoked(reason))
            }
            Err(SyncError::TokenRefreshTransient(message)) => {
                self.db
                    .set_connection_sync_error(&connection.id, &message)?;
                Err(SyncError::TokenRefreshTransient(message))
            }
            Err(error) => Err(error),
        }
    }
}
