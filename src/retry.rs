//! Retry and polling helpers with exponential backoff.
//!
//! Two flavours are provided:
//!
//! - [`retry_with_backoff`] retries a fallible async operation with jittered
//!   exponential backoff until it succeeds or `max_attempts` is exhausted.
//! - [`poll_with_backoff`] polls a condition on a fixed, deterministic schedule
//!   with a bounded number of steps and reports `None` when it never became
//!   ready. Errors from the condition abort the poll immediately.
//!
//! ```ignore
//! use hosted_operator::retry::{poll_with_backoff, BackoffSchedule};
//!
//! let secret = poll_with_backoff(&BackoffSchedule::default(), "ca_secret", || async {
//!     match secrets.get(ns, name).await {
//!         Ok(s) => Ok(Some(s)),
//!         Err(e) if e.is_not_found() => Ok(None),
//!         Err(e) => Err(e),
//!     }
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
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
            max_attempts: 0,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Returns the first success, or the last error once `max_attempts` is
/// exhausted. A `max_attempts` of zero retries forever.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "operation failed after max retries"
            );
            return Err(err);
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis(),
            "operation failed, retrying"
        );

        tokio::time::sleep(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

/// Deterministic exponential schedule for [`poll_with_backoff`]
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSchedule {
    /// Delay after the first unsuccessful check
    pub initial: Duration,
    /// Growth factor applied after each step
    pub factor: f64,
    /// Upper bound for any single delay
    pub cap: Duration,
    /// Number of checks before giving up
    pub steps: u32,
}

impl Default for BackoffSchedule {
    /// 2s, 4s, 8s, 16s, 20s, 20s
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            factor: 2.0,
            cap: Duration::from_secs(20),
            steps: 6,
        }
    }
}

impl BackoffSchedule {
    /// The delays slept between checks, in order
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.steps as usize);
        let mut next = self.initial.min(self.cap);
        for _ in 0..self.steps {
            delays.push(next);
            next = Duration::from_secs_f64(
                (next.as_secs_f64() * self.factor).min(self.cap.as_secs_f64()),
            );
        }
        delays
    }
}

/// Poll `check` until it yields `Some`, sleeping per `schedule` between checks.
///
/// Returns `Ok(None)` after `schedule.steps` checks without a value. An `Err`
/// from `check` ends polling and is returned unchanged.
pub async fn poll_with_backoff<F, Fut, T, E>(
    schedule: &BackoffSchedule,
    operation_name: &str,
    mut check: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for (step, delay) in schedule.delays().into_iter().enumerate() {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
        debug!(
            operation = %operation_name,
            step = step + 1,
            delay_ms = delay.as_millis(),
            "condition not met yet"
        );
        tokio::time::sleep(delay).await;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<&str, &str> = retry_with_backoff(&fast_retry(5), "token", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not populated")
                } else {
                    Ok("token")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("token"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error_when_exhausted() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), &str> = retry_with_backoff(&fast_retry(3), "token", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_default_schedule_caps_at_twenty_seconds() {
        let secs: Vec<u64> = BackoffSchedule::default()
            .delays()
            .iter()
            .map(Duration::as_secs)
            .collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 20, 20]);
    }

    /// Story: a value that appears on the third check is returned
    #[tokio::test(start_paused = true)]
    async fn story_poll_returns_once_condition_holds() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<Option<u32>, String> =
            poll_with_backoff(&BackoffSchedule::default(), "ca", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    Ok((n == 2).then_some(n))
                }
            })
            .await;

        assert_eq!(result, Ok(Some(2)));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Story: the schedule is bounded; a condition that never holds yields None
    #[tokio::test(start_paused = true)]
    async fn story_poll_gives_up_after_all_steps() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<Option<()>, String> =
            poll_with_backoff(&BackoffSchedule::default(), "ca", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .await;

        assert_eq!(result, Ok(None));
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_stops_on_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<Option<()>, &str> =
            poll_with_backoff(&BackoffSchedule::default(), "ca", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("forbidden")
                }
            })
            .await;

        assert_eq!(result, Err("forbidden"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
