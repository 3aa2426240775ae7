use std::future::Future;
use std::time::Duration;

use drive_core::{ApiErrorClass, DriveError};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT_BASE: Duration = Duration::from_millis(7_000);
pub const DEFAULT_TIMEOUT_MAX: Duration = Duration::from_millis(60_000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error(transparent)]
    Remote(#[from] DriveError),
}

impl CallError {
    pub fn class(&self) -> ApiErrorClass {
        match self {
            CallError::Timeout(_) => ApiErrorClass::Transient,
            CallError::Remote(err) => err.classification(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{0}")]
    Fatal(DriveError),
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: CallError },
}

impl RetryError {
    pub fn class(&self) -> ApiErrorClass {
        match self {
            RetryError::Fatal(err) => err.classification(),
            RetryError::ExhaustedRetries { last, .. } => last.class(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ApiErrorClass::NotFound
    }
}

/// Pause inserted between two attempts of the same call.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = capped_doubling(self.base, self.max, attempt);
        if self.jitter && !exp.is_zero() {
            Duration::from_millis(rng.gen_range(0..=duration_ms(exp)))
        } else {
            exp
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(10), true)
    }
}

/// Bounded retry with a per-attempt timeout that doubles after every failed
/// attempt, up to `max_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_timeout: Duration,
    max_timeout: Duration,
    max_attempts: u32,
    pause: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_BASE, DEFAULT_TIMEOUT_MAX, DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    pub fn new(base_timeout: Duration, max_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            base_timeout,
            max_timeout,
            max_attempts: max_attempts.max(1),
            pause: Backoff::default(),
        }
    }

    pub fn with_pause(mut self, pause: Backoff) -> Self {
        self.pause = pause;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Timeout of the 1-based `attempt`: `min(base * 2^(attempt-1), max)`.
    pub fn timeout_for_attempt(&self, attempt: u32) -> Duration {
        capped_doubling(self.base_timeout, self.max_timeout, attempt.saturating_sub(1))
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriveError>>,
    {
        let mut attempt = 1u32;
        loop {
            let timeout = self.timeout_for_attempt(attempt);
            let err = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if !err.is_retryable() => return Err(RetryError::Fatal(err)),
                Ok(Err(err)) => CallError::Remote(err),
                Err(_) => CallError::Timeout(timeout),
            };

            if attempt >= self.max_attempts {
                warn!(op, attempts = attempt, error = %err, "remote call exhausted retries");
                return Err(RetryError::ExhaustedRetries {
                    attempts: attempt,
                    last: err,
                });
            }

            let pause = self.pause_after(&err, attempt);
            debug!(
                op,
                attempt,
                next_timeout_ms = duration_ms(self.timeout_for_attempt(attempt + 1)),
                pause_ms = duration_ms(pause),
                error = %err,
                "retrying remote call"
            );
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            attempt += 1;
        }
    }

    fn pause_after(&self, err: &CallError, attempt: u32) -> Duration {
        let backoff = self.pause.delay(attempt - 1);
        match err {
            CallError::Remote(remote) => remote
                .retry_after()
                .map(|hint| hint.min(self.max_timeout).max(backoff))
                .unwrap_or(backoff),
            CallError::Timeout(_) => backoff,
        }
    }
}

fn capped_doubling(base: Duration, max: Duration, shift: u32) -> Duration {
    let exp = duration_ms(base)
        .saturating_mul(1u64 << shift.min(32))
        .min(duration_ms(max));
    Duration::from_millis(exp)
}

fn duration_ms(value: Duration) -> u64 {
    value.as_millis().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use drive_core::StatusCode;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn quiet_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(DEFAULT_TIMEOUT_BASE, DEFAULT_TIMEOUT_MAX, attempts).with_pause(Backoff::none())
    }

    #[test]
    fn timeouts_double_until_cap() {
        let policy = RetryPolicy::default();
        let expected = [7_000, 14_000, 28_000, 56_000, 60_000, 60_000, 60_000];
        for (index, ms) in expected.iter().enumerate() {
            assert_eq!(
                policy.timeout_for_attempt(index as u32 + 1),
                Duration::from_millis(*ms)
            );
        }
        assert_eq!(policy.timeout_for_attempt(200), DEFAULT_TIMEOUT_MAX);
    }

    #[test]
    fn backoff_without_jitter_is_exponential() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            false,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn backoff_with_jitter_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        assert!(backoff.delay_with_rng(3, &mut rng) <= Duration::from_millis(800));
        assert_eq!(Backoff::none().delay_with_rng(4, &mut rng), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_timeouts_follow_capped_schedule() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let policy = quiet_policy(7);
        let recorded = Arc::clone(&starts);
        let origin = Instant::now();

        let err = policy
            .run("list", move || {
                recorded.lock().unwrap().push(Instant::now());
                std::future::pending::<Result<(), DriveError>>()
            })
            .await
            .unwrap_err();

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 7);
        let gaps: Vec<u128> = starts
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).as_millis())
            .collect();
        assert_eq!(gaps, vec![7_000, 14_000, 28_000, 56_000, 60_000, 60_000]);
        assert_eq!(starts[0], origin);
        match err {
            RetryError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 7);
                assert!(matches!(last, CallError::Timeout(t) if t == DEFAULT_TIMEOUT_MAX));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let policy = quiet_policy(7);

        let value = policy
            .run("copy", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(DriveError::api(StatusCode::SERVICE_UNAVAILABLE, "busy"))
                    } else {
                        Ok(call)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let policy = quiet_policy(7);

        let err = policy
            .run("copy", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DriveError::api(StatusCode::UNAUTHORIZED, "expired")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Fatal(_)));
        assert_eq!(err.class(), ApiErrorClass::Auth);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_last_error() {
        let calls = AtomicU32::new(0);
        let policy = quiet_policy(3);

        let err = policy
            .run("create_folder", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(DriveError::api(StatusCode::TOO_MANY_REQUESTS, "slow")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.class(), ApiErrorClass::RateLimit);
        assert!(err.to_string().contains("gave up after 3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_is_honoured() {
        let calls = AtomicU32::new(0);
        let policy = quiet_policy(2);
        let started = Instant::now();

        policy
            .run("copy", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(DriveError::Api {
                            status: StatusCode::TOO_MANY_REQUESTS,
                            body: String::new(),
                            retry_after: Some(Duration::from_secs(2)),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
