//! Resilience utilities: the deadline-bounded retry combinator.
//!
//! Every network-fallible poll in the harness goes through [`retry`]:
//!
//! - [`RetryPolicy`]: total timeout, poll interval and the exponential
//!   backoff applied after failed attempts
//! - [`Check`]: the success condition a result must satisfy
//!
//! An attempt that *fails* (the operation returns `Err`) is logged and
//! counted as a non-matching attempt. It never aborts the loop by itself.
//! Consecutive failures back off exponentially. The first attempt that
//! returns a value (matching or not) resets the backoff to the plain poll
//! interval.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> repdyno::error::Result<()> {
//! use repdyno::resilience::{retry, Check, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::polling(Duration::from_secs(60), Duration::from_secs(5));
//! let done = retry("wait_for_flag", &policy, &Check::Equals(true), || async {
//!     Ok::<_, std::io::Error>(true)
//! })
//! .await?;
//! assert!(done);
//! # Ok(())
//! # }
//! ```

use crate::error::{HarnessError, Result};
use crate::metrics;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

/// Timing contract for one retried operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Give up after this long. `None` retries forever.
    pub timeout: Option<Duration>,

    /// Delay after an attempt that returned a non-matching value.
    pub interval: Duration,

    /// Delay after the first failed attempt in a row.
    pub initial_backoff: Duration,

    /// Ceiling for exponential backoff.
    pub max_backoff: Duration,

    /// Backoff multiplier per consecutive failure.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            interval: Duration::from_secs(5),
            initial_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Convergence polling: given deadline and interval, default backoff.
    ///
    /// A zero timeout means "no deadline".
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Failures in a row  Delay
    /// -----------------  -----
    /// 1                  4s
    /// 2                  8s
    /// 3                  16s
    /// ...
    /// 7+                 300s (cap)
    /// ```
    pub fn polling(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout: (!timeout.is_zero()).then_some(timeout),
            interval,
            ..Default::default()
        }
    }

    /// Reaching a server at startup: 30s budget, 10s between attempts.
    pub fn connect() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            interval: Duration::from_secs(10),
            ..Default::default()
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            timeout: Some(Duration::from_secs(1)),
            interval: Duration::from_millis(10),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Delay after the given number of consecutive failures (1-indexed).
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        // past 2^1024 every factor above 1 is infinite anyway
        let exponent = (failures - 1).min(1024) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_backoff.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

/// Success condition for a retried operation's result.
pub enum Check<T> {
    /// Any successfully returned value.
    Any,
    /// The value must equal this literal.
    Equals(T),
    /// The value must satisfy this predicate.
    Predicate(Box<dyn Fn(&T) -> bool + Send + Sync>),
}

impl<T: PartialEq> Check<T> {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Box::new(f))
    }

    pub fn matches(&self, value: &T) -> bool {
        match self {
            Self::Any => true,
            Self::Equals(expected) => value == expected,
            Self::Predicate(f) => f(value),
        }
    }
}

/// Run `op` until its result satisfies `check` or the policy's deadline
/// passes.
///
/// Returns the first matching result, or
/// [`HarnessError::RetryTimeoutExceeded`] carrying the configured timeout.
/// The deadline is checked before each attempt, so an in-flight attempt
/// always runs to completion.
pub async fn retry<T, E, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    check: &Check<T>,
    mut op: F,
) -> Result<T>
where
    T: PartialEq,
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let start = Instant::now();
    let deadline = policy.timeout.map(|t| start + t);
    let mut attempt: u32 = 0;
    let mut failures: u32 = 0;

    loop {
        if let (Some(deadline), Some(timeout)) = (deadline, policy.timeout) {
            if Instant::now() >= deadline {
                error!(
                    operation,
                    attempts = attempt,
                    timeout_ms = timeout.as_millis() as u64,
                    "Retry timeout exceeded"
                );
                metrics::record_retry_timeout(operation);
                return Err(HarnessError::RetryTimeoutExceeded {
                    operation: operation.to_string(),
                    timeout,
                });
            }
        }

        attempt += 1;
        let delay = match op().await {
            Ok(value) => {
                failures = 0;
                if check.matches(&value) {
                    metrics::record_retry_attempt(operation, "matched");
                    debug!(
                        operation,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Retry condition satisfied"
                    );
                    return Ok(value);
                }
                metrics::record_retry_attempt(operation, "mismatch");
                debug!(
                    operation,
                    attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Condition not yet met"
                );
                policy.interval
            }
            Err(e) => {
                failures += 1;
                metrics::record_retry_attempt(operation, "error");
                let backoff = policy.delay_for_failure(failures);
                warn!(
                    operation,
                    attempt,
                    failures,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Attempt failed, backing off"
                );
                backoff
            }
        };

        // Never sleep past the deadline.
        let delay = match deadline {
            Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
            None => delay,
        };
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_polling_policy() {
        let policy = RetryPolicy::polling(Duration::from_secs(60), Duration::from_secs(5));
        assert_eq!(policy.timeout, Some(Duration::from_secs(60)));
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.max_backoff, Duration::from_secs(300));
    }

    #[test]
    fn test_polling_zero_timeout_is_unbounded() {
        let policy = RetryPolicy::polling(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(policy.timeout, None);
    }

    #[test]
    fn test_connect_policy() {
        let policy = RetryPolicy::connect();
        assert_eq!(policy.timeout, Some(Duration::from_secs(30)));
        assert_eq!(policy.interval, Duration::from_secs(10));
    }

    #[test]
    fn test_delay_for_failure() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_failure(0), policy.interval);
        assert_eq!(policy.delay_for_failure(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_failure(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_failure(3), Duration::from_secs(16));
        assert_eq!(policy.delay_for_failure(6), Duration::from_secs(128));
        assert_eq!(policy.delay_for_failure(7), Duration::from_secs(256));
        // Should cap at max_backoff
        assert_eq!(policy.delay_for_failure(8), Duration::from_secs(300));
        assert_eq!(policy.delay_for_failure(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_delay_for_failure_stays_capped_for_huge_counts() {
        let policy = RetryPolicy::polling(Duration::from_secs(60), Duration::from_secs(1));
        for failures in [1025, 1 << 31, (1 << 31) + 1, u32::MAX - 1] {
            assert_eq!(policy.delay_for_failure(failures), policy.max_backoff);
        }
    }

    #[test]
    fn test_check_variants() {
        assert!(Check::<bool>::Any.matches(&false));
        assert!(Check::Equals(true).matches(&true));
        assert!(!Check::Equals(true).matches(&false));
        let empty = Check::predicate(|v: &Vec<u32>| v.is_empty());
        assert!(empty.matches(&vec![]));
        assert!(!empty.matches(&vec![1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_first_match() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy::polling(Duration::from_secs(60), Duration::from_secs(1));

        let result = retry("count_to_three", &policy, &Check::Equals(3), || {
            let c = c.clone();
            async move { Ok::<_, String>(c.fetch_add(1, Ordering::SeqCst) + 1) }
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_times_out_within_bounds() {
        let start = Instant::now();
        let policy = RetryPolicy::polling(Duration::from_secs(2), Duration::from_secs(1));

        let err = retry("never", &policy, &Check::Equals(true), || async {
            Ok::<_, String>(false)
        })
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed <= Duration::from_secs(4));
        assert_eq!(err.retry_timeout(), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_swallows_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy::polling(Duration::from_secs(600), Duration::from_secs(1));

        let result = retry("flaky", &policy, &Check::Any, || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(format!("transient failure {}", n))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_on_consecutive_errors() {
        let start = Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy::polling(Duration::from_secs(600), Duration::from_secs(1));

        retry("flaky", &policy, &Check::Any, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("down")
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        // 4s + 8s + 16s of backoff before the fourth attempt.
        assert_eq!(start.elapsed(), Duration::from_secs(28));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_value() {
        let start = Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = RetryPolicy::polling(Duration::from_secs(600), Duration::from_secs(1));

        // error, value (mismatch), error, match
        retry("mixed", &policy, &Check::Equals(3), || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    Err("blip")
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        // 4s backoff, 1s interval, 4s backoff again (not 8s).
        assert_eq!(start.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_never_sleeps_past_deadline() {
        let start = Instant::now();
        let policy = RetryPolicy::polling(Duration::from_secs(2), Duration::from_secs(1));

        let err = retry("always_down", &policy, &Check::<()>::Any, || async {
            Err::<(), _>("down")
        })
        .await
        .unwrap_err();

        assert!(matches!(err, HarnessError::RetryTimeoutExceeded { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
