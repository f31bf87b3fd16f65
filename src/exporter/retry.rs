//! Retry with exponential backoff for export attempts.

use crate::error::{Result, SandtraceError};
use std::future::Future;
use std::time::Duration;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// No retries at all; the first failure is final.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate delay for retry attempt (exponential backoff)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64) * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Runs `operation` until it succeeds or the retries are exhausted.
    /// `on_retry` sees the attempt number and the error before each wait.
    pub async fn retry<F, Fut, T>(&self, mut operation: F, mut on_retry: impl FnMut(usize, &SandtraceError)) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<SandtraceError> = None;

        for attempt in 0..=self.max_retries {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt < self.max_retries {
                        on_retry(attempt, &e);
                        tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(SandtraceError::ExportFailure(format!(
            "gave up after {} attempts: {}",
            self.max_retries + 1,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string())
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0)
    }

    #[tokio::test]
    async fn test_retry_success_after_failure() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut retries = 0;

        let result = fast()
            .retry(
                move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                            Err(SandtraceError::ExportFailure("collector unavailable".into()))
                        } else {
                            Ok(7)
                        }
                    }
                },
                |_, _| retries += 1,
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let result: Result<()> = fast()
            .retry(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(SandtraceError::ExportFailure("down".into())) }
                },
                |_, _| {},
            )
            .await;

        assert!(matches!(result, Err(SandtraceError::ExportFailure(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for_attempt(1) > policy.delay_for_attempt(0));
        assert_eq!(policy.delay_for_attempt(30), policy.max_delay);
    }
}
