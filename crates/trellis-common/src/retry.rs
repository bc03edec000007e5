//! Retry utilities with exponential backoff and jitter.
//!
//! Used by the resource applier for retriable infrastructure failures
//! (contention, throttling, API server hiccups). Fatal errors are returned on
//! the first attempt.
//!
//! # Example
//!
//! ```ignore
//! use trellis_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let obj = retry_with_backoff(&RetryConfig::default(), "apply Namespace/vault", || async {
//!     cluster.apply(&manifest).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Backoff configuration for retriable operations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation, retrying retriable failures with exponential
/// backoff and jitter.
///
/// Errors for which [`Error::is_retryable`] is false are returned immediately.
/// After `max_attempts` the last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result = retry_with_backoff(&fast_config(3), "op", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_retriable_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = retry_with_backoff(&fast_config(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::retriable("op", "etcd leader changed"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_with_backoff(&fast_config(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::retriable("op", "connection reset"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::RetriableInfra { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), Error> = retry_with_backoff(&fast_config(5), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::fatal("op", "manifest missing kind"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Fatal { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
