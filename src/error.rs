use thiserror::Error;

use crate::db::DbError;

/// Errors that change caller behavior somewhere in the sync pipeline.
/// Everything else is wrapped in `Provider` with the provider's message.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("provider token revoked: {0}")]
    TokenRevoked(String),

    #[error("token refresh failed: {0}")]
    TokenRefreshTransient(String),

    #[error("rate limit exceeded after {attempts} attempts: {message}")]
    RateLimitExceeded { attempts: u32, message: String },

    #[error("history cursor invalid or expired")]
    InvalidHistoryCursor,

    #[error("sync job already in progress: {0}")]
    ConflictingJobInProgress(String),

    #[error("sync already in progress for connection {0}")]
    SyncInProgress(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("folder not found: {0}")]
    FolderNotFound(String),

    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] DbError),

    #[error("provider request failed: {0}")]
    Provider(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Rate-limit detection used by the back-off wrapper: HTTP 429 or a
    /// provider message mentioning quota/rate/limit.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Provider(message) => {
                let lower = message.to_ascii_lowercase();
                lower.contains("429")
                    || lower.contains("quota")
                    || lower.contains("rate")
                    || lower.contains("limit")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SyncError;

    #[test]
    fn rate_limit_detection_matches_provider_messages() {
        assert!(SyncError::Provider("status=429 body=slow down".into()).is_rate_limited());
        assert!(SyncError::Provider("User quota exceeded".into()).is_rate_limited());
        assert!(SyncError::Provider("Rate limit hit".into()).is_rate_limited());
        assert!(!SyncError::Provider("status=500 internal".into()).is_rate_limited());
        assert!(!SyncError::TokenRevoked("invalid_grant".into()).is_rate_limited());
    }
}
