use std::time::Duration;

use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::healing::delay_for;
use crate::{Error, Result};

/// Retry schedule for metadata store writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let base = config.persistence_backoff();
        Self {
            attempts: config.persistence_retries.max(1),
            base,
            cap: base.saturating_mul(32),
        }
    }

    /// No retries, for tests that assert on the first failure.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            base: Duration::ZERO,
            cap: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Run a store write, retrying retryable failures with exponential backoff.
///
/// The final error is returned to the caller, which must not publish the
/// event the write was guarding.
pub async fn persist_with_retry<T, F>(what: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                let delay = delay_for(attempt, policy.base, policy.cap);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "store write failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(what, attempt, error = %e, "store write failed");
                return Err(match e {
                    Error::PersistenceFailure(_) => e,
                    other if other.is_retryable() => Error::PersistenceFailure(other.to_string()),
                    other => other,
                });
            }
        }
    }
}
