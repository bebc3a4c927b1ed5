//! Retry budgets and backoff delays

use std::time::{Duration, SystemTime};

/// Base delay before the first retry
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Cap on any single backoff delay
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Retry budget for one error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Whether the failure may be retried at all
    pub allowed: bool,
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub const fn never() -> Self {
        Self {
            allowed: false,
            max_retries: 0,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// A policy allowing up to `max_retries` retries
    #[must_use]
    pub const fn up_to(max_retries: u32) -> Self {
        Self {
            allowed: true,
            max_retries,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Override the base delay
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }
}

/// Compute the delay before retry `attempt` (zero-based).
///
/// Exponential backoff: `min(base_delay * 2^attempt + jitter, max_delay)`.
/// Jitter is 0-25% of the computed delay, derived from `SystemTime` to avoid
/// pulling in a full random number generator.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}
