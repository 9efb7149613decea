use std::{fmt::Display, future::Future, time::Duration};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Fibonacci backoff with a bounded number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the failed attempt with index `attempt` (zero based).
    ///
    /// Follows 1, 1, 2, 3, 5, 8, ... times the base delay.
    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let calculated = self.base_delay_ms.saturating_mul(fibonacci(attempt));
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000, 6)
    }
}

fn fibonacci(index: u32) -> u64 {
    let (mut current, mut next) = (1_u64, 1_u64);
    for _ in 0..index.min(92) {
        let sum = current.saturating_add(next);
        current = next;
        next = sum;
    }
    current
}

/// Terminal error returned once every attempt allowed by the policy failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description} failed after {attempts} attempts, retry limit reached")]
pub struct RetryExhausted<E> {
    /// What was being attempted.
    pub description: String,
    /// Number of times the operation ran.
    pub attempts: u32,
    /// Failure returned by the final attempt.
    #[source]
    pub last_error: E,
}

/// Run `operation` until it succeeds or the policy's attempt budget is spent.
///
/// The caller is suspended between attempts. There is no cancellation or
/// deadline: wrap the call in `tokio::time::timeout` to bound total latency.
pub async fn retry_with_backoff<T, E, F, Fut>(
    description: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempts: u32 = 0;
    loop {
        info!("trying: {description}");
        let err = match operation().await {
            Ok(value) => {
                info!("{description} succeeded");
                return Ok(value);
            }
            Err(err) => err,
        };

        attempts = attempts.saturating_add(1);
        if attempts >= policy.max_attempts() {
            warn!(attempts, error = %err, "{description} failed, retry limit reached");
            return Err(RetryExhausted {
                description: description.to_owned(),
                attempts,
                last_error: err,
            });
        }

        let delay = policy.delay_for_attempt(attempts - 1, None);
        debug!(
            attempts,
            error = %err,
            "{description} failed, retrying in {:.3}s",
            delay.as_secs_f64()
        );
        tokio::time::sleep(delay).await;
    }
}
