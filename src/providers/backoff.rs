use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{SyncError, SyncResult};

pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Exponential delay with full jitter: 2^attempt * base + rand(0..base).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self.base.saturating_mul(1u32 << attempt.min(16));
        let jitter_micros = rand::thread_rng().gen_range(0..=self.base.as_micros().max(1) as u64);
        exponential + Duration::from_micros(jitter_micros)
    }
}

/// Retry `op` only on recognized rate-limit errors; everything else
/// propagates immediately. Once the attempts are spent this raises
/// RateLimitExceeded, which fails the job.
pub async fn with_backoff<T, F, Fut>(op_name: &str, policy: BackoffPolicy, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut last_message = String::new();

    for attempt in 0..policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_rate_limited() => {
                last_message = error.to_string();
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    op = op_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, backing off"
                );
                sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }

    Err(SyncError::RateLimitExceeded {
        attempts: policy.max_attempts,
        message: last_message,
    })
}
