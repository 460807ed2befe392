//! Retry policy and backoff calculation.
//!
//! Backoff is exponential with a cap: `min(2^attempt * base_delay, max_delay)`.
//! The decision between another attempt and exhaustion is a pure function so
//! the retry coordinator only has to persist its result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry backoff policy shared by all executions of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry is doubled per attempt from this base.
    #[serde(with = "serde_duration", rename = "base_delay_secs")]
    pub base_delay: Duration,

    /// Upper bound on any single backoff delay.
    #[serde(with = "serde_duration", rename = "max_delay_secs")]
    pub max_delay: Duration,
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt no earlier than `ready_at`.
    Retry { ready_at: DateTime<Utc> },
    /// Attempts are used up.
    Exhaust,
}

impl RetryPolicy {
    /// Create a policy with the given base and cap.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Backoff delay to apply after `attempt` failed attempts.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide what follows a failure, given the attempt count including the
    /// attempt that just failed.
    pub fn decide(&self, attempt_count: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        if attempt_count > max_retries {
            return RetryDecision::Exhaust;
        }
        let delay = chrono::Duration::from_std(self.backoff(attempt_count))
            .unwrap_or(chrono::Duration::MAX);
        let ready_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry { ready_at }
    }
}

impl Default for RetryPolicy {
    /// One second base, one hour cap.
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(3600))
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as whole seconds (matching the YAML config format).
pub(crate) mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
