//! Bounded retry with exponentially growing delay.
//!
//! Injected into media downloads so the attempt loop lives in one place
//! instead of at every call site.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero is treated as one.
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Growth factor applied per further attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay to wait before attempt number `attempt` (0-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let nanos = self.base_delay.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Runs `operation` until it succeeds or attempts are exhausted.
    ///
    /// The closure receives the 0-based attempt number. The last error is
    /// returned when every attempt fails.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                tracing::debug!(
                    target_url = %label,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(target_url = %label, attempt = attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt + 1 < attempts => {
                    tracing::warn!(
                        target_url = %label,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Attempt failed"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
