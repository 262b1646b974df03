//! Bounded retry and backoff logic for Vegh transfers
//!
//! Every network operation in the snapshot transport goes through
//! [`with_policy`]: an operation is attempted up to `max_attempts` times,
//! sleeping between attempts according to an exponential backoff curve.
//! Errors are classified by the caller as transient (retry) or permanent
//! (stop immediately).

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Boxed error carried through the retry loop
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: BoxError,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: BoxError,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: BoxError,
    },
}

impl RetryError {
    /// Consume the error and return the underlying cause
    pub fn into_source(self) -> BoxError {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }

    /// Number of attempts made before giving up, when known
    pub fn attempts(&self) -> Option<usize> {
        match self {
            RetryError::MaxRetriesExceeded { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// Attempt bound plus the backoff curve between attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: usize,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Jitter applied to each interval, 0.0 disables it
    pub randomization_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            max_interval,
            ..Self::default()
        }
    }

    /// Policy that never sleeps, for tests and local operations
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            multiplier: 1.0,
            randomization_factor: 0.0,
        }
    }

    /// Build the backoff iterator for one retry loop
    ///
    /// The attempt count bounds the loop, so the elapsed-time cap is disabled.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_randomization_factor(self.randomization_factor)
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(8),
            multiplier: 2.0,
            randomization_factor: 0.2,
        }
    }
}

/// Execute an operation under `policy`
///
/// `f` receives the 1-based attempt number. A `Permanent` error stops the
/// loop at once and is returned as-is; any other error is retried until the
/// attempt bound, after which `MaxRetriesExceeded` carries the last cause.
pub async fn with_policy<F, T>(op_name: &'static str, policy: &RetryPolicy, mut f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    let mut backoff = policy.backoff();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(operation = op_name, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(operation = op_name, attempt, error = %err, "Operation failed permanently");
                return Err(err);
            }
            Err(err) => {
                warn!(operation = op_name, attempt, max_attempts, error = %err, "Operation failed");

                if attempt >= max_attempts {
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source: err.into_source(),
                    });
                }

                let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                attempt += 1;

                #[cfg(feature = "async-rt")]
                tokio::time::sleep(delay).await;

                #[cfg(not(feature = "async-rt"))]
                std::thread::sleep(delay);
            }
        }
    }
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Wrap an error into the retry variant matching its classification
pub fn classify<E>(operation: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation,
            source: Box::new(err),
        }
    } else {
        RetryError::Permanent {
            operation,
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Error, Debug)]
    enum UploadFailure {
        #[error("server busy")]
        Busy,
        #[error("token rejected")]
        Denied,
    }

    impl RetryableError for UploadFailure {
        fn is_transient(&self) -> bool {
            matches!(self, UploadFailure::Busy)
        }
    }

    #[test]
    fn test_classification_through_trait_object() {
        let failures: Vec<Box<dyn RetryableError>> =
            vec![Box::new(UploadFailure::Busy), Box::new(UploadFailure::Denied)];
        let permanent: Vec<bool> = failures.iter().map(|f| f.is_permanent()).collect();
        assert_eq!(permanent, vec![false, true]);

        assert!(matches!(classify("upload", UploadFailure::Busy), RetryError::Transient { .. }));
        assert!(matches!(classify("upload", UploadFailure::Denied), RetryError::Permanent { .. }));
    }

    /// Fails with `failure` for the first `failures` attempts, then succeeds
    fn flaky(
        calls: Arc<AtomicUsize>,
        failures: usize,
        failure: fn() -> UploadFailure,
    ) -> impl FnMut(usize) -> BoxFuture<'static, usize> {
        move |attempt| {
            let seen = calls.fetch_add(1, Ordering::SeqCst);
            let fut: BoxFuture<'static, usize> = Box::pin(async move {
                if seen < failures {
                    Err(classify("upload", failure()))
                } else {
                    Ok(attempt)
                }
            });
            fut
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let attempt = with_policy("upload", &RetryPolicy::immediate(3), flaky(Arc::clone(&calls), 0, || UploadFailure::Busy))
            .await
            .unwrap();

        assert_eq!(attempt, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_busy_server_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let attempt = with_policy("upload", &RetryPolicy::immediate(5), flaky(Arc::clone(&calls), 2, || UploadFailure::Busy))
            .await
            .unwrap();

        assert_eq!(attempt, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_bound_is_respected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = with_policy("upload", &RetryPolicy::immediate(4), flaky(Arc::clone(&calls), usize::MAX, || UploadFailure::Busy))
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), Some(4));
        assert!(err.to_string().contains("server busy"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.into_source().downcast::<UploadFailure>().is_ok());
    }

    #[tokio::test]
    async fn test_rejected_token_stops_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = with_policy("upload", &RetryPolicy::immediate(5), flaky(Arc::clone(&calls), usize::MAX, || UploadFailure::Denied))
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Permanent { .. }));
        assert_eq!(err.attempts(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[cfg(feature = "async-rt")]
    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            randomization_factor: 0.0,
        };
        let start = tokio::time::Instant::now();

        let calls = Arc::new(AtomicUsize::new(0));
        let result = with_policy("upload", &policy, flaky(calls, usize::MAX, || UploadFailure::Busy)).await;

        assert!(result.is_err());
        // 1s after the first attempt, 2s after the second
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_policy_clamps_attempts() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10), Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(RetryPolicy::default().max_attempts, 5);
    }
}
