//! Bounded fixed-delay retry for lookups that may lag behind the kernel or
//! the switch.
//!
//! A freshly added switch port can report port number 0 for a short while,
//! and a VF representor can disappear from sysfs for a moment after its pod
//! is deleted. Both are retried a fixed number of times with a fixed delay
//! before a [`FwdError::TransientLookupFailure`] is surfaced.

use std::future::Future;
use std::time::Duration;

use crate::error::{FwdError, FwdResult};

/// How many times to try a lookup, and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero is treated
    /// as one.
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a new policy.
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500))
    }
}

/// Runs `op` until it yields a value or the policy is exhausted.
///
/// `op` returns:
/// - `Ok(Some(v))` when the value is visible, which ends the loop,
/// - `Ok(None)` when the value is not visible yet,
/// - `Err(e)`; retryable errors are retried, all others end the loop.
pub async fn retry_fixed<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> FwdResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FwdResult<Option<T>>>,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                tracing::info!(what, attempt, attempts, "Lookup not visible yet");
            }
            Err(e) if e.is_retryable() => {
                tracing::info!(what, attempt, attempts, error = %e, "Lookup failed transiently");
            }
            Err(e) => return Err(e),
        }
        if attempt < attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }
    Err(FwdError::transient(what, attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const FAST: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(1));

    #[tokio::test]
    async fn test_succeeds_after_not_visible() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = retry_fixed(FAST, "ofport", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok(if n < 2 { None } else { Some(7u32) })
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_is_transient_failure() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: FwdResult<u32> = retry_fixed(FAST, "representor", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await;

        match result {
            Err(FwdError::TransientLookupFailure { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_hard_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: FwdResult<u32> = retry_fixed(FAST, "ofport", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FwdError::switch("get-port-id", "no such bridge"))
        })
        .await;

        assert!(matches!(
            result,
            Err(FwdError::SwitchProgrammingFailed { .. })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let value = retry_fixed(policy, "x", || async { Ok(Some(1)) })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }
}
