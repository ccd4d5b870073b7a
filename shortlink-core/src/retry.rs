use crate::Result;
use std::time::Duration;

/// Exponential backoff used for notification delivery and reminder redelivery.
///
/// Notifications give up after `max_attempts` retries. Reminders never give
/// up (they must eventually fire); they keep retrying at `max_backoff` once
/// the exponential curve tops out.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_attempts: u32,

    /// Backoff before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for any single backoff
    pub max_backoff: Duration,

    /// Multiplier applied to backoff after each retry
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Returns a policy with no retries.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Quick retries for in-process transient faults.
    pub fn fast() -> Self {
        Self::new(3, Duration::from_millis(10), Duration::from_millis(100), 2.0)
    }

    pub fn standard() -> Self {
        Self::new(5, Duration::from_millis(100), Duration::from_secs(5), 2.0)
    }

    /// Backoff before retry number `attempt` (0-indexed), capped at `max_backoff`.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
    }
}

impl Default for RetryPolicy {
    /// Same as `standard()`.
    fn default() -> Self {
        Self::standard()
    }
}

/// Runs `operation`, retrying retryable failures according to `policy`.
///
/// Non-retryable errors (see `Error::is_retryable`) are returned at once.
///
/// ```no_run
/// use shortlink_core::retry::{retry_with_policy, RetryPolicy};
/// use shortlink_core::{Error, Result};
///
/// fn deliver_notification() -> Result<()> {
///     Err(Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout")))
/// }
///
/// let result = retry_with_policy(&RetryPolicy::fast(), deliver_notification);
/// ```
pub fn retry_with_policy<F, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= policy.max_attempts => return Err(e),
            Err(_) => {
                std::thread::sleep(policy.backoff_duration(attempt));
                attempt += 1;
            }
        }
    }
}
