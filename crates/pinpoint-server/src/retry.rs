//! Bounded exponential backoff for transient store and persistence failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use pinpoint_core::error::GameError;

use crate::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = capped.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return capped;
        }
        let jitter = rand::rng().random_range(0..=jitter_ms);
        capped.saturating_sub(Duration::from_millis(jitter))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. The last error is returned unchanged.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, GameError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GameError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(what, attempt, ?delay, error = %e, "Retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(what, attempts = attempt, error = %e, "Retries exhausted");
                }
                return Err(e);
            },
        }
    }
}
