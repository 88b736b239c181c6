use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;

/// Exponential backoff applied when a failed job goes back to `Pending`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay in milliseconds; the n-th attempt waits `base * 2^n`.
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 6 * 60 * 60 * 1000,
        }
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            base_delay_ms: config.retry_base_delay_ms,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

/// What to do with a job whose handler just failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureDecision {
    /// Return to `Pending`, claimable again after `delay_ms`.
    Retry { delay_ms: u64 },
    /// Terminal; never retried automatically.
    DeadLetter,
}

/// Backoff delay after the given number of attempts.
///
/// Formula: `min(base_delay * 2^attempts, max_delay)`.
pub fn compute_retry_delay(attempts: i32, policy: &RetryPolicy) -> Duration {
    let exp = attempts.max(0) as u32;
    let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
    let delay_ms = policy
        .base_delay_ms
        .saturating_mul(factor)
        .min(policy.max_delay_ms);
    Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX))
}

/// A job may retry only when the handler allowed it and the claim budget
/// (`attempts`, counted at claim time) has room left.
pub fn can_retry(attempts: i32, max_attempts: i32, should_retry: bool) -> bool {
    should_retry && attempts < max_attempts
}

pub fn decide_failure(
    attempts: i32,
    max_attempts: i32,
    should_retry: bool,
    policy: &RetryPolicy,
) -> FailureDecision {
    if can_retry(attempts, max_attempts, should_retry) {
        let delay = compute_retry_delay(attempts, policy);
        FailureDecision::Retry {
            delay_ms: delay.num_milliseconds().max(0) as u64,
        }
    } else {
        FailureDecision::DeadLetter
    }
}

/// `now + delay_ms`, or `None` when the instant is out of range.
pub fn checked_delay(now: DateTime<Utc>, delay_ms: u64) -> Option<DateTime<Utc>> {
    let delay = Duration::try_milliseconds(i64::try_from(delay_ms).ok()?)?;
    now.checked_add_signed(delay)
}

/// Next `available_at` for a retried job; never moves backwards.
pub fn next_available_at(
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
    delay_ms: u64,
) -> Option<DateTime<Utc>> {
    checked_delay(now, delay_ms).map(|at| previous.max(at))
}

/// Jobs locked before this instant are considered abandoned.
pub fn stuck_cutoff(now: DateTime<Utc>, stuck_job_timeout_minutes: u64) -> DateTime<Utc> {
    let minutes = i64::try_from(stuck_job_timeout_minutes).unwrap_or(i64::MAX);
    Duration::try_minutes(minutes)
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Terminal jobs finished before this instant may be deleted.
pub fn retention_cutoff(now: DateTime<Utc>, older_than_days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(older_than_days))
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
