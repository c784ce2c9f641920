//! Exponential backoff for broker reconnection and transient failures.
//!
//! ```rust
//! use order_relay::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// `max_retries: None` retries until cancelled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: Option<usize>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder { policy: Self::default() }
    }

    /// Reconnect policy: unbounded attempts, 500ms doubling up to 30s.
    pub fn reconnect() -> Self {
        Self { max_retries: None, initial_delay: Duration::from_millis(500), ..Self::default() }
    }

    /// delay = initial_delay * multiplier^attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }

    fn exhausted(&self, attempt: usize) -> bool {
        self.max_retries.is_some_and(|max| attempt >= max)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = Some(max_retries);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.policy.max_retries = None;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted(E),
    Cancelled,
}

/// Runs `operation` until it succeeds, the policy is exhausted, or `cancel` fires.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, what, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if policy.exhausted(attempt) {
                    tracing::error!(attempt, what, error = %err, "Operation failed after max retries");
                    return Err(RetryError::Exhausted(err));
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(attempt, what, delay_ms = delay.as_millis() as u64, error = %err, "Operation failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .build();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let policy = RetryPolicy::builder().initial_delay(Duration::from_millis(1)).max_retries(5).build();
        let result = retry_with_backoff(&policy, &CancellationToken::new(), "flaky", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err("down") } else { Ok(7) }
        }).await;
        assert_eq!(result.ok(), Some(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_and_honours_cancel() {
        let policy = RetryPolicy::builder().initial_delay(Duration::from_millis(1)).max_retries(2).build();
        let result: Result<(), _> = retry_with_backoff(&policy, &CancellationToken::new(), "down", || async { Err("no") }).await;
        assert!(matches!(result, Err(RetryError::Exhausted("no"))));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<&str>> =
            retry_with_backoff(&RetryPolicy::reconnect(), &cancel, "down", || async { Err("no") }).await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
