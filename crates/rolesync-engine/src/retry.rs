//! Retry of read-only collaborator calls with exponential backoff.
//!
//! Only inspection queries go through here. Statements that change the
//! cluster are never retried.

use std::time::Duration;

use tracing::debug;

use rolesync_core::CollaboratorResult;

/// Backoff policy for inspection queries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap on a single wait.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fail on the first error.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Runs a read-only call until it succeeds, fails permanently or exhausts
/// [`RetryConfig::max_retries`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before retry number `attempt` (0-indexed).
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let delay_ms = base_ms.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Run `operation`, retrying transient failures.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> CollaboratorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = CollaboratorResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_transient() || attempt >= self.config.max_retries => {
                    return Err(e)
                }
                Err(e) => {
                    let delay = self.calculate_delay(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_core::CollaboratorError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryExecutor {
        RetryExecutor::new(RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        })
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = fast()
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CollaboratorError>(42) }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_on_transient_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = fast()
            .execute(|| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CollaboratorError::connection_failed("reset"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fails_on_permanent_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: CollaboratorResult<()> = fast()
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CollaboratorError::query_failed("syntax error")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: CollaboratorResult<()> = fast()
            .execute(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CollaboratorError::connection_failed("refused")) }
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_is_capped() {
        let executor = fast();
        assert_eq!(executor.calculate_delay(0), Duration::from_millis(1));
        assert_eq!(executor.calculate_delay(1), Duration::from_millis(2));
        assert_eq!(executor.calculate_delay(10), Duration::from_millis(5));
    }
}
