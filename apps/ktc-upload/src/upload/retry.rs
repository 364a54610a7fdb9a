//! Retry Policy
//!
//! Bounded exponential backoff for transient transport failures. The delay
//! before attempt `n + 1` is `base_delay * multiplier^(n - 1)`.

use std::future::Future;
use std::time::Duration;

use super::types::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS};
use crate::config::RetryConfig;
use crate::error::{Operation, UploadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: u32,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one attempt
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: multiplier.max(1),
        }
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor)
    }

    /// Every delay the policy can sleep, in order
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(|attempt| self.delay_for(attempt))
    }

    /// Run `call` until it succeeds, fails non-transiently, or the attempt
    /// budget is spent. Exhaustion yields [`UploadError::FatalTransport`].
    pub async fn run<T, F, Fut>(&self, operation: Operation, mut call: F) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        operation = %operation,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into_fatal(attempt)),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            2,
        )
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> UploadError {
        UploadError::Transient {
            operation: Operation::UploadChunk,
            status: Some(503),
            reason: "service unavailable".to_string(),
        }
    }

    #[test]
    fn test_default_delays() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![Duration::from_millis(500), Duration::from_millis(1000)]
        );
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_transient_is_attempted_three_times() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = policy
            .run(Operation::UploadChunk, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1600), "{elapsed:?}");
        match result {
            Err(UploadError::FatalTransport { attempts, operation, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(operation, Operation::UploadChunk);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let counter = &attempts;
        let started = tokio::time::Instant::now();

        let result = policy
            .run(Operation::Init, move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(transient())
                } else {
                    Ok("U1")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "U1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result: Result<(), _> = policy
            .run(Operation::Init, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(UploadError::Validation("bad filename".to_string()))
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(UploadError::Validation(_))));
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 0,
            base_delay_ms: 10,
            multiplier: 3,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for(3), Duration::from_millis(90));
    }
}
