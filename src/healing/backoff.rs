//! Retry timing as a pure function of the attempt number.

use std::time::Duration;

use crate::config::ErrorHandlingPolicy;

/// Delay before retry `attempt` (1-based): `base * 2^attempt`, capped.
pub fn delay_for(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// The full retry schedule a policy allows before escalation.
pub fn schedule(policy: &ErrorHandlingPolicy) -> Vec<Duration> {
    (1..=policy.max_attempts)
        .map(|attempt| delay_for(attempt, policy.base_backoff(), policy.max_backoff()))
        .collect()
}
