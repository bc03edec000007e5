//! Readiness poller
//!
//! Every wait in a bootstrap run goes through [`wait_until`]: poll a check
//! function at a fixed interval until it reports [`PollResult::Ready`], the
//! [`WaitSpec`] timeout elapses, or the caller cancels the wait.
//!
//! Transient failures (object not created yet, API server briefly unreachable)
//! never fail the wait; resources here are routinely created asynchronously by
//! other controllers. A check that hits a non-retriable error returns `Err`
//! and the wait stops immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::Error;

/// Default interval between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default budget for a single wait
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult<T> {
    /// Condition met
    Ready(T),
    /// Condition not met; carries a short description of what was observed
    NotYetReady(String),
    /// Check could not be evaluated this time (resource missing, API hiccup)
    TransientError(String),
}

impl<T> PollResult<T> {
    /// Map a failed check to `TransientError` if retriable, or propagate it.
    pub fn from_error(err: Error) -> Result<Self, Error> {
        if err.is_retryable() {
            Ok(Self::TransientError(err.to_string()))
        } else {
            Err(err)
        }
    }
}

/// Parameters for a single wait. Built per call site, never persisted.
#[derive(Debug, Clone)]
pub struct WaitSpec {
    /// Human-readable description used in logs and errors
    pub description: String,
    /// Time between polls
    pub interval: Duration,
    /// Maximum time to wait; `None` waits forever
    pub timeout: Option<Duration>,
    /// Token that aborts the wait when cancelled
    pub cancel: Option<CancellationToken>,
}

impl WaitSpec {
    /// Bounded wait
    pub fn new(description: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            description: description.into(),
            interval,
            timeout: Some(timeout),
            cancel: None,
        }
    }

    /// Wait with no timeout. Callers must treat this as a known liveness gap.
    pub fn unbounded(description: impl Into<String>, interval: Duration) -> Self {
        Self {
            description: description.into(),
            interval,
            timeout: None,
            cancel: None,
        }
    }

    /// Attach a cancellation token
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// Poll `check` until it returns [`PollResult::Ready`].
///
/// Returns the ready value, [`Error::Timeout`] carrying the last observation,
/// [`Error::Cancelled`], or the first non-retriable error from `check`.
pub async fn wait_until<T, F, Fut>(spec: &WaitSpec, mut check: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollResult<T>, Error>>,
{
    let start = Instant::now();
    let mut last_observed: Option<String> = None;
    let mut attempt = 0u32;

    if spec.timeout.is_none() {
        warn!(wait = %spec.description, "Waiting without a timeout");
    }

    loop {
        if spec.is_cancelled() {
            return Err(Error::Cancelled {
                what: spec.description.clone(),
            });
        }

        attempt += 1;
        match check().await? {
            PollResult::Ready(value) => {
                debug!(wait = %spec.description, attempt, "Condition met");
                return Ok(value);
            }
            PollResult::NotYetReady(observed) => {
                debug!(wait = %spec.description, attempt, observed = %observed, "Not ready yet");
                last_observed = Some(observed);
            }
            PollResult::TransientError(msg) => {
                trace!(wait = %spec.description, attempt, error = %msg, "Transient error, polling again");
                last_observed = Some(msg);
            }
        }

        let elapsed = start.elapsed();
        if let Some(timeout) = spec.timeout {
            if elapsed >= timeout {
                return Err(Error::timeout(&spec.description, last_observed, elapsed));
            }
        }

        match &spec.cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(Error::Cancelled { what: spec.description.clone() });
                    }
                    _ = tokio::time::sleep(spec.interval) => {}
                }
            }
            None => tokio::time::sleep(spec.interval).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn spec(timeout_secs: u64) -> WaitSpec {
        WaitSpec::new(
            "test condition",
            Duration::from_secs(2),
            Duration::from_secs(timeout_secs),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn returns_ready_value() {
        let value = wait_until(&spec(10), || async { Ok(PollResult::Ready(7)) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_polling() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = wait_until(&spec(60), || {
            let c = c.clone();
            async move {
                match c.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(PollResult::TransientError("secret not found".to_string())),
                    1 => Ok(PollResult::NotYetReady("secret has no data".to_string())),
                    _ => Ok(PollResult::Ready(())),
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_last_observation() {
        let err = wait_until::<(), _, _>(&spec(10), || async {
            Ok(PollResult::NotYetReady("phase=Pending".to_string()))
        })
        .await
        .unwrap_err();

        match err {
            Error::Timeout { last_observed, .. } => {
                assert_eq!(last_observed.as_deref(), Some("phase=Pending"));
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_check_error_stops_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let err = wait_until::<(), _, _>(&spec(60), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::fatal("check", "forbidden"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Fatal { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_wait() {
        let token = CancellationToken::new();
        let spec = spec(300).with_cancel(token.clone());
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let err = wait_until::<(), _, _>(&spec, || {
            let c = c.clone();
            let token = token.clone();
            async move {
                // Second observation shows the object moved away from success
                if c.fetch_add(1, Ordering::SeqCst) == 1 {
                    token.cancel();
                }
                Ok(PollResult::NotYetReady("Degraded".to_string()))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn from_error_classifies() {
        let transient = PollResult::<()>::from_error(Error::not_ready("Secret/x", "404"));
        assert!(matches!(transient, Ok(PollResult::TransientError(_))));

        let fatal = PollResult::<()>::from_error(Error::fatal("get", "403"));
        assert!(fatal.is_err());
    }
}
