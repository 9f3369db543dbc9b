//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure retrying of failed
//! messages and of transient I/O against the log, the cursor store and the
//! dead-letter sink.
use std::future::Future;
use std::time;

use tracing::warn;

#[derive(Clone, Debug)]
/// A retry policy to determine retry parameters.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Determine interval for retrying at a given attempt number (starting at 1).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let multiplier = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate_interval = self
            .initial_interval
            .checked_mul(multiplier)
            .unwrap_or(time::Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(5)),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

/// The last error seen once retrying gave up.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with an error `is_transient` rejects, or
/// `max_attempts` attempts have been made. Sleeps between attempts according
/// to `policy`.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    max_attempts: u32,
    what: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && attempt < max_attempts => {
                let backoff = policy.retry_interval(attempt);
                warn!(
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "{what} failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(error) => {
                return Err(Exhausted {
                    error,
                    attempts: attempt,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();
        let first_interval = retry_policy.retry_interval(1);
        let second_interval = retry_policy.retry_interval(2);
        let third_interval = retry_policy.retry_interval(3);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(2));
        assert_eq!(third_interval, time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();
        let first_interval = retry_policy.retry_interval(1);
        let second_interval = retry_policy.retry_interval(2);
        let third_interval = retry_policy.retry_interval(3);
        let fourth_interval = retry_policy.retry_interval(4);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(4));
        assert_eq!(third_interval, time::Duration::from_secs(4));
        assert_eq!(fourth_interval, time::Duration::from_secs(4));
    }

    #[test]
    fn test_retry_interval_does_not_overflow() {
        let retry_policy = RetryPolicy::build(10, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(30))
            .provide();

        assert_eq!(
            retry_policy.retry_interval(100),
            time::Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_retry_transient_succeeds_after_failures() {
        let policy = RetryPolicy::build(1, time::Duration::from_millis(1)).provide();
        let calls = AtomicU32::new(0);

        let result: Result<u32, Exhausted<String>> =
            retry_transient(&policy, 5, "test op", |_| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("failure {n}"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up() {
        let policy = RetryPolicy::build(1, time::Duration::from_millis(1)).provide();
        let calls = AtomicU32::new(0);

        let result: Result<(), Exhausted<String>> =
            retry_transient(&policy, 3, "test op", |_| true, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("still down".to_string())
            })
            .await;

        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_does_not_retry_permanent_errors() {
        let policy = RetryPolicy::build(1, time::Duration::from_millis(1)).provide();
        let calls = AtomicU32::new(0);

        let result: Result<(), Exhausted<String>> = retry_transient(
            &policy,
            5,
            "test op",
            |e: &String| e != "permanent",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("permanent".to_string())
            },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
