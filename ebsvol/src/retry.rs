//! Retry executor - bounded exponential backoff around remote calls.
//!
//! Every remote operation the provider issues runs inside a [`RetryPolicy`].
//! Attempts are numbered from 1. After a failed attempt `n` the executor
//! sleeps `min(base * 2^(n-1), max)` scaled by a random factor in
//! `[0.5, 1.0)`, never less than `base`, then tries again. Errors outside
//! the policy's [`RetryOn`] class are returned immediately; the error of the
//! final attempt is returned unmodified.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_MAX_TRIES: u32 = 10;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Which errors are worth another attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RetryOn {
    /// Every error is retried.
    #[default]
    Any,
    /// Only API errors carrying one of these codes are retried.
    Codes(Vec<String>),
}

impl RetryOn {
    pub fn matches(&self, err: &Error) -> bool {
        match self {
            RetryOn::Any => true,
            RetryOn::Codes(codes) => err
                .api_code()
                .is_some_and(|code| codes.iter().any(|c| c == code)),
        }
    }
}

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            retry_on: RetryOn::Any,
        }
    }
}

impl RetryPolicy {
    /// Same timing, but only retry API errors with the given codes.
    pub fn only(&self, codes: &[&str]) -> Self {
        Self {
            retry_on: RetryOn::Codes(codes.iter().map(|c| c.to_string()).collect()),
            ..self.clone()
        }
    }

    /// Delay after failed attempt `attempt`, with `jitter` in `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, jitter: f64) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let scaled = capped.mul_f64(0.5 * (1.0 + jitter.clamp(0.0, 1.0)));
        scaled.max(self.base_delay)
    }

    /// Start counting attempts for one retried operation.
    pub fn attempts<'a>(&'a self, label: &'a str) -> Attempts<'a> {
        Attempts {
            policy: self,
            label,
            attempt: 0,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. `op` receives the attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = self.attempts(label);
        loop {
            let attempt = attempts.next_attempt();
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => attempts.backoff(e).await?,
            }
        }
    }
}

/// Attempt counter for a retried operation.
///
/// Used directly where the retried body needs `&mut` access to its
/// surroundings, which a closure passed to [`RetryPolicy::run`] cannot hold
/// across awaits.
pub struct Attempts<'a> {
    policy: &'a RetryPolicy,
    label: &'a str,
    attempt: u32,
}

impl Attempts<'_> {
    /// Begin the next attempt and emit the progress notice.
    pub fn next_attempt(&mut self) -> u32 {
        self.attempt += 1;
        info!(
            attempt = self.attempt,
            max_tries = self.policy.max_tries,
            "Attempt {} of {}",
            self.attempt,
            self.label
        );
        self.attempt
    }

    /// Sleep before the next attempt, or hand `err` back if it must not be
    /// retried.
    pub async fn backoff(&self, err: Error) -> Result<()> {
        if !self.policy.retry_on.matches(&err) {
            return Err(err);
        }
        if self.attempt >= self.policy.max_tries.max(1) {
            warn!(
                attempt = self.attempt,
                "Giving up on {} after {} attempts: {}", self.label, self.attempt, err
            );
            return Err(err);
        }
        let delay = self.policy.delay_for(self.attempt, rand::random::<f64>());
        warn!(
            attempt = self.attempt,
            delay_secs = delay.as_secs_f64(),
            "Attempt {} of {} failed: {}", self.attempt, self.label, err
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Run `op` under `policy`. See [`RetryPolicy::run`].
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.run(label, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ApiError, REQUEST_LIMIT_EXCEEDED};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(code: &str) -> Error {
        ApiError::new("DescribeVolumes", code, "boom").into()
    }

    #[test]
    fn test_delay_for_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 1..=12 {
            for jitter in [0.0, 0.25, 0.5, 0.999] {
                let d = policy.delay_for(attempt, jitter);
                assert!(d >= DEFAULT_BASE_DELAY, "attempt {attempt}: {d:?}");
                assert!(d <= DEFAULT_MAX_DELAY, "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn test_delay_for_grows_then_caps() {
        let policy = RetryPolicy {
            max_tries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            retry_on: RetryOn::Any,
        };
        // jitter close to 1 keeps almost the full exponential value
        assert_eq!(policy.delay_for(1, 1.0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2, 1.0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3, 1.0), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4, 1.0), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5, 1.0), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40, 1.0), Duration::from_secs(10));
        // half jitter, floored at base
        assert_eq!(policy.delay_for(1, 0.0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4, 0.0), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_on_codes() {
        let only = RetryOn::Codes(vec![REQUEST_LIMIT_EXCEEDED.to_string()]);
        assert!(only.matches(&api_error(REQUEST_LIMIT_EXCEEDED)));
        assert!(!only.matches(&api_error("InvalidVolume.NotFound")));
        assert!(!only.matches(&Error::Catalog("x".into())));
        assert!(RetryOn::Any.matches(&Error::Catalog("x".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let result = policy
            .run("test op", move |attempt| async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                if attempt < DEFAULT_MAX_TRIES {
                    Err(api_error("Throttled"))
                } else {
                    Ok(attempt * 7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), DEFAULT_MAX_TRIES * 7);
        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_MAX_TRIES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let err = with_retries(&policy, "test op", move |attempt| async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err::<(), Error>(ApiError::new("AttachVolume", "Busy", format!("attempt {attempt}")).into())
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), DEFAULT_MAX_TRIES);
        match err {
            Error::Api(e) => {
                assert_eq!(e.code, "Busy");
                assert_eq!(e.message, format!("attempt {DEFAULT_MAX_TRIES}"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_fast() {
        let policy = RetryPolicy::default().only(&[REQUEST_LIMIT_EXCEEDED]);
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;

        let err = policy
            .run("test op", move |_| async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err::<(), Error>(api_error("UnauthorizedOperation"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.api_code(), Some("UnauthorizedOperation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let policy = RetryPolicy::default();
        let start = tokio::time::Instant::now();

        let result = policy
            .run("test op", |attempt| async move {
                if attempt < 3 {
                    Err(api_error(REQUEST_LIMIT_EXCEEDED))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        // first delay is exactly base, second lies in [base, max)
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(91), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_try_policy() {
        let policy = RetryPolicy {
            max_tries: 1,
            ..RetryPolicy::default()
        };
        let mut attempts = policy.attempts("once");
        assert_eq!(attempts.next_attempt(), 1);
        assert!(attempts.backoff(api_error("X")).await.is_err());
    }
}
