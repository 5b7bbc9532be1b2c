//! Bounded retry loop around a single model call.
//!
//! Each attempt holds a limiter slot for the duration of the call only, runs
//! under an explicit deadline, and on failure consults the classifier to decide
//! between backing off and giving up.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::classify::{backoff_for, classify};
use super::limiter::ConcurrencyLimiter;
use crate::config::LlmConfig;
use crate::error::{CallError, CallResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Ceiling applied to the classifier's suggested backoff.
    pub max_backoff: Duration,
    /// Deadline for one call.
    pub call_timeout: Duration,
    /// How long to wait for a limiter slot before failing.
    pub slot_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_backoff: Duration::from_secs(60),
            call_timeout: Duration::from_secs(120),
            slot_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&LlmConfig> for RetryPolicy {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            max_backoff: config.max_backoff,
            call_timeout: config.request_timeout,
            slot_timeout: config.slot_timeout,
        }
    }
}

/// Value returned by a successful call plus how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, hits a non-retryable error, or the
/// attempt cap is reached.
///
/// A slot that cannot be acquired within `slot_timeout` aborts immediately with
/// `SlotUnavailable`; it is never treated as a retryable call failure.
pub async fn call_with_retry<F, Fut, T>(
    limiter: &ConcurrencyLimiter,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    operation: F,
) -> CallResult<Attempted<T>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = CallResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }

        let slot = limiter
            .acquire(policy.slot_timeout)
            .await
            .ok_or(CallError::SlotUnavailable {
                waited: policy.slot_timeout,
            })?;

        let outcome = tokio::select! {
            res = tokio::time::timeout(policy.call_timeout, operation()) => {
                res.unwrap_or(Err(CallError::Deadline(policy.call_timeout)))
            }
            _ = cancel.cancelled() => Err(CallError::Cancelled),
        };
        slot.release();

        let error = match outcome {
            Ok(value) => {
                debug!(label, attempts = attempt + 1, "Model call succeeded");
                return Ok(Attempted {
                    value,
                    attempts: attempt + 1,
                });
            }
            Err(CallError::Cancelled) => return Err(CallError::Cancelled),
            Err(e) => e,
        };

        let category = classify(&error);
        if !category.is_retryable() {
            warn!(label, %category, "Model call failed, not retrying: {}", error);
            return Err(CallError::Fatal {
                category,
                message: error.to_string(),
            });
        }

        if attempt + 1 >= max_attempts {
            warn!(
                label,
                %category,
                attempts = attempt + 1,
                "Model call failed, attempts exhausted: {}",
                error
            );
            return Err(CallError::Transient {
                category,
                attempts: attempt + 1,
                message: error.to_string(),
            });
        }

        let delay = backoff_for(category, attempt).min(policy.max_backoff);
        warn!(
            label,
            %category,
            attempt = attempt + 1,
            ?delay,
            "Model call failed, retrying: {}",
            error
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(CallError::Cancelled),
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::classify::ErrorCategory;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            max_backoff: Duration::from_secs(60),
            call_timeout: Duration::from_secs(5),
            slot_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let calls = AtomicU32::new(0);

        let result = call_with_retry(
            &limiter,
            &policy(3),
            &CancellationToken::new(),
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CallError::status(503, "unavailable"))
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
        assert_eq!(limiter.available_slots(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let calls = AtomicU32::new(0);

        let err = call_with_retry(
            &limiter,
            &policy(5),
            &CancellationToken::new(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallError::status(401, "unauthorized")) }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            CallError::Fatal {
                category: ErrorCategory::AuthError,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let calls = AtomicU32::new(0);

        let err = call_with_retry(
            &limiter,
            &policy(3),
            &CancellationToken::new(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallError::status(429, "slow down")) }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            CallError::Transient {
                category, attempts, ..
            } => {
                assert_eq!(category, ErrorCategory::RateLimit);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_timeout_category() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();

        let err = call_with_retry(
            &limiter,
            &policy(2),
            &CancellationToken::new(),
            "test",
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            CallError::Transient {
                category: ErrorCategory::Timeout,
                attempts: 2,
                ..
            }
        ));
        assert_eq!(limiter.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_no_slot_is_explicit_failure() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let _held = limiter.try_acquire().unwrap();

        let err = call_with_retry(
            &limiter,
            &policy(3),
            &CancellationToken::new(),
            "test",
            || async { Ok(()) },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CallError::SlotUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_call() {
        let limiter = ConcurrencyLimiter::new(1).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = call_with_retry(&limiter, &policy(3), &cancel, "test", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
    }
}
