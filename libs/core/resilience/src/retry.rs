//! The retry runner.

use std::future::Future;
use std::time::Duration;

use core_config::ConfigError;
use rand::RngExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RetryConfig;

/// Errors that expose a stable failure-class name.
///
/// The class is matched against `RetryConfig::retry_on` /
/// `RetryConfig::never_retry_on`. Classes are behavioural ("timeout",
/// "contention", "io", ...), not type names.
pub trait FailureClass {
    fn failure_class(&self) -> &str;
}

/// Terminal outcome of a retry loop that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All attempts failed (or the failure class was not retryable). The
    /// final failure is carried unchanged.
    #[error("{source}")]
    Exhausted { attempts: u32, source: E },

    /// The loop terminated without either a success or a failure. Reaching
    /// this is a misconfiguration (e.g. zero attempts), not an I/O fault.
    #[error("retry loop finished without success or failure")]
    Logic,
}

impl<E> RetryError<E> {
    /// The original failure, if the loop produced one.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            Self::Logic => None,
        }
    }
}

type AttemptHook = Box<dyn Fn(u32) + Send + Sync>;
type SleepHook = Box<dyn Fn(u32, Duration) + Send + Sync>;

/// Drives a unit of work up to `max_attempts` times with full-jitter
/// backoff between attempts.
///
/// Hooks mirror the attempt lifecycle:
/// - `on_before` fires once per attempt, with the 1-based attempt number;
/// - `on_after` fires after each *failed* attempt;
/// - `on_before_sleep` fires before each sleep, with the planned duration.
///
/// There is no sleep after the final attempt.
pub struct Retry {
    config: RetryConfig,
    before: Option<AttemptHook>,
    after: Option<AttemptHook>,
    before_sleep: Option<SleepHook>,
}

impl Retry {
    /// Build a runner after validating the config.
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            before: None,
            after: None,
            before_sleep: None,
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn on_before(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.before = Some(Box::new(hook));
        self
    }

    pub fn on_after(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.after = Some(Box::new(hook));
        self
    }

    pub fn on_before_sleep(
        mut self,
        hook: impl Fn(u32, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.before_sleep = Some(Box::new(hook));
        self
    }

    /// Run an asynchronous unit of work under this retry policy.
    pub async fn run<T, E, F, Fut>(&self, mut work: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureClass + std::fmt::Display,
    {
        for attempt in 1..=self.config.max_attempts {
            if let Some(hook) = &self.before {
                hook(attempt);
            }

            match work().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if let Some(hook) = &self.after {
                        hook(attempt);
                    }

                    if !self.should_retry(&error) {
                        debug!(
                            attempt,
                            class = error.failure_class(),
                            "failure class is not retryable"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    if attempt == self.config.max_attempts {
                        warn!(attempts = attempt, error = %error, "retry attempts exhausted");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = self.draw_sleep(attempt);
                    if let Some(hook) = &self.before_sleep {
                        hook(attempt, delay);
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(RetryError::Logic)
    }

    /// Run a synchronous unit of work under this retry policy.
    ///
    /// Identical hook and backoff semantics to [`Retry::run`], with a
    /// blocking sleep. Do not call from an async context.
    pub fn run_blocking<T, E, F>(&self, mut work: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: FailureClass + std::fmt::Display,
    {
        for attempt in 1..=self.config.max_attempts {
            if let Some(hook) = &self.before {
                hook(attempt);
            }

            match work() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if let Some(hook) = &self.after {
                        hook(attempt);
                    }

                    if !self.should_retry(&error) || attempt == self.config.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = self.draw_sleep(attempt);
                    if let Some(hook) = &self.before_sleep {
                        hook(attempt, delay);
                    }
                    std::thread::sleep(delay);
                }
            }
        }

        Err(RetryError::Logic)
    }

    fn should_retry<E: FailureClass>(&self, error: &E) -> bool {
        let class = error.failure_class();

        // Deny-list takes precedence over allow-list.
        if let Some(never) = &self.config.never_retry_on
            && never.iter().any(|c| c == class)
        {
            return false;
        }

        match &self.config.retry_on {
            Some(allow) => allow.iter().any(|c| c == class),
            None => true,
        }
    }

    fn draw_sleep(&self, attempt: u32) -> Duration {
        let low = self.config.wait_min;
        let high = self.config.backoff_ceiling(attempt).max(low);

        let seconds = if high > low {
            rand::rng().random_range(low..=high)
        } else {
            low
        };

        Duration::from_secs_f64(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Error)]
    #[error("{message}")]
    struct TestError {
        class: &'static str,
        message: String,
    }

    impl TestError {
        fn io(message: &str) -> Self {
            Self {
                class: "io",
                message: message.to_string(),
            }
        }

        fn integrity(message: &str) -> Self {
            Self {
                class: "integrity",
                message: message.to_string(),
            }
        }
    }

    impl FailureClass for TestError {
        fn failure_class(&self) -> &str {
            self.class
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig::new().with_wait(0.001, 0.002)
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_hook = calls.clone();

        let retry = Retry::new(fast_config()).unwrap();
        let result = retry
            .run(|| {
                let calls = calls_hook.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_jitter_two_failures_then_success() {
        // Fails twice, succeeds on the third attempt: exactly 3 invocations
        // and 2 sleeps, each within [wait_min, ceiling].
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_wait(0.01, 0.02)
            .with_multiplier(1.0)
            .with_exp_base(2.0);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_work = calls.clone();
        let sleeps: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let sleeps_hook = sleeps.clone();

        let retry = Retry::new(config).unwrap().on_before_sleep(move |_, delay| {
            sleeps_hook.lock().unwrap().push(delay);
        });

        let result = retry
            .run(|| {
                let calls = calls_work.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::io("flaky"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let sleeps = sleeps.lock().unwrap();
        assert_eq!(sleeps.len(), 2);
        for delay in sleeps.iter() {
            let secs = delay.as_secs_f64();
            assert!(secs >= 0.01 && secs <= 0.02, "sleep {secs} out of bounds");
        }
    }

    #[tokio::test]
    async fn test_hook_invocation_counts() {
        let before = Arc::new(Mutex::new(Vec::new()));
        let after = Arc::new(Mutex::new(Vec::new()));
        let before_sleep = Arc::new(Mutex::new(Vec::new()));

        let before_hook = before.clone();
        let after_hook = after.clone();
        let sleep_hook = before_sleep.clone();

        let retry = Retry::new(fast_config().with_max_attempts(5))
            .unwrap()
            .on_before(move |n| before_hook.lock().unwrap().push(n))
            .on_after(move |n| after_hook.lock().unwrap().push(n))
            .on_before_sleep(move |n, _| sleep_hook.lock().unwrap().push(n));

        let calls = Arc::new(AtomicU32::new(0));
        let calls_work = calls.clone();

        let result = retry
            .run(|| {
                let calls = calls_work.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::io("flaky"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(*before.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*after.lock().unwrap(), vec![1, 2]);
        assert_eq!(*before_sleep.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_deny_list_takes_precedence() {
        // "integrity" appears in both lists; the deny-list wins and the
        // failure propagates after a single attempt.
        let config = fast_config()
            .with_max_attempts(5)
            .retry_on(["io", "integrity"])
            .never_retry_on(["integrity"]);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_work = calls.clone();

        let result: Result<(), _> = Retry::new(config)
            .unwrap()
            .run(|| {
                let calls = calls_work.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::integrity("duplicate key"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result.unwrap_err() {
            RetryError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.message, "duplicate key");
            }
            RetryError::Logic => panic!("expected exhaustion"),
        }
    }

    #[tokio::test]
    async fn test_allow_list_excludes_other_classes() {
        let config = fast_config().with_max_attempts(5).retry_on(["timeout"]);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_work = calls.clone();

        let result: Result<(), _> = Retry::new(config)
            .unwrap()
            .run(|| {
                let calls = calls_work.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::io("refused"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_exhaustion_returns_final_failure_unchanged() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_work = calls.clone();

        let result: Result<(), _> = Retry::new(fast_config())
            .unwrap()
            .run(|| {
                let calls = calls_work.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::io("still down"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let source = result.unwrap_err().into_source().unwrap();
        assert_eq!(source.message, "still down");
        assert_eq!(source.class, "io");
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        assert!(Retry::new(fast_config().with_max_attempts(0)).is_err());
        assert!(Retry::new(fast_config().with_wait(-1.0, 0.002)).is_err());
        assert!(Retry::new(fast_config().with_exp_base(0.5)).is_err());
    }

    #[tokio::test]
    async fn test_exited_loop_is_a_logic_fault() {
        // A zero-attempt config cannot pass `new`; build the runner by hand
        // to prove the loop-exit guard still reports the distinguished fault.
        let mut config = fast_config();
        config.max_attempts = 0;
        let retry = Retry {
            config,
            before: None,
            after: None,
            before_sleep: None,
        };

        let result: Result<(), _> = retry
            .run(|| async { Err(TestError::io("unreachable")) })
            .await;

        assert!(matches!(result.unwrap_err(), RetryError::Logic));
    }

    #[test]
    fn test_run_blocking_matches_async_semantics() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_work = calls.clone();
        let sleeps = Arc::new(Mutex::new(Vec::new()));
        let sleeps_hook = sleeps.clone();

        let retry = Retry::new(fast_config().with_max_attempts(4))
            .unwrap()
            .on_before_sleep(move |n, _| sleeps_hook.lock().unwrap().push(n));

        let result = retry.run_blocking(|| {
            if calls_work.fetch_add(1, Ordering::SeqCst) < 1 {
                Err(TestError::io("flaky"))
            } else {
                Ok(7)
            }
        });

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sleeps.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_jitter_draw_respects_bounds() {
        let retry = Retry::new(
            RetryConfig::new()
                .with_wait(0.01, 0.05)
                .with_multiplier(1.0)
                .with_exp_base(2.0),
        )
        .unwrap();

        for attempt in 1..=6 {
            let ceiling = retry.config().backoff_ceiling(attempt).max(0.01);
            for _ in 0..50 {
                let delay = retry.draw_sleep(attempt).as_secs_f64();
                assert!(delay >= 0.01 && delay <= ceiling + 1e-9);
            }
        }
    }
}
