use chrono::{DateTime, Duration, Utc};

/// Retry policy for failed task attempts.
///
/// The delay before the next attempt is `base_delay * 2^retry_count`, where `retry_count` is the
/// number of retries already spent before this failure: 5 minutes, then 10, then 20, ...
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::minutes(5), max_delay: None }
    }
}

/// What to do with a task whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the task back in the queue, claimable from `scheduled_at`.
    Retry { retry_count: u32, scheduled_at: DateTime<Utc> },

    /// No attempts left, fail the task for good.
    Exhausted { retry_count: u32 },
}

impl RetryPolicy {
    pub fn backoff(&self, retry_count: u32) -> Duration {
        // 2^31 * base already overflows any sane schedule, clamp the exponent.
        let multiplier = 1i32 << retry_count.min(30);
        let delay = self.base_delay.checked_mul(multiplier).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(max) if delay > max => max,
            _ => delay,
        }
    }

    /// Decide the fate of a task after a failed attempt.
    ///
    /// # Arguments
    ///
    /// `retry_count` - Retries already spent by the task before this failure.
    /// `max_retries` - Attempt limit of the task.
    /// `failed_at` - When the attempt failed.
    ///
    pub fn decide(&self, retry_count: u32, max_retries: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        let next_count = retry_count.saturating_add(1);
        if next_count >= max_retries {
            return RetryDecision::Exhausted { retry_count: next_count };
        }

        let scheduled_at = failed_at
            .checked_add_signed(self.backoff(retry_count))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry { retry_count: next_count, scheduled_at }
    }
}
