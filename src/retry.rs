//! Bounded retry with capped exponential backoff.
//!
//! Shared by the inference adapters and the judge grader. Retries are local
//! to one call and never coordinated across examples.

use std::future::Future;
use std::time::Duration;

/// Retry policy for one adapter or grader call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1
    pub max_attempts: u32,
    /// Backoff unit; the delay after attempt `n` is `unit * 2^n`
    pub unit: Duration,
    /// Upper bound on a single delay
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    /// Policy with the standard one-second unit and eight-second cap
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            unit: Duration::from_secs(1),
            cap: Duration::from_secs(8),
        }
    }

    /// Same backoff with a different attempt budget
    #[must_use]
    pub const fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// Override the backoff unit and cap (tests use milliseconds)
    #[must_use]
    pub const fn with_backoff(mut self, unit: Duration, cap: Duration) -> Self {
        self.unit = unit;
        self.cap = cap;
        self
    }

    /// Delay after the zero-based `attempt`: `min(unit * 2^attempt, cap)`
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.min(16));
        self.unit.saturating_mul(factor).min(self.cap)
    }

    /// Run `attempt_fn` until it succeeds or attempts are exhausted.
    ///
    /// Sleeps between attempts only; the last error is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt when every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut attempt_fn: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 >= self.max_attempts => {
                    tracing::warn!(label, attempt, error = %e, "attempts exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        label,
                        attempt,
                        delay_ms = millis(delay),
                        error = %e,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
