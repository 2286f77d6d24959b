//! Retry policy shared by the job queue and in-process retries.
//!
//! Backoff is either exponential (`initial * multiplier^attempt`) or polynomial
//! (`initial * (attempt + 1)^exponent`), capped at `max_backoff`.

use crate::error::AppError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    Exponential { multiplier: f64 },
    Polynomial { exponent: u32 },
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff: Backoff,
    /// Adds up to 25% random jitter.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Policy for queued jobs: polynomial backoff over minutes, capped at an hour.
    pub fn for_jobs(max_attempts: u32) -> Self {
        Self {
            max_retries: max_attempts.saturating_sub(1),
            initial_backoff: Duration::from_secs(15),
            max_backoff: Duration::from_secs(3600),
            backoff: Backoff::Polynomial { exponent: 4 },
            add_jitter: true,
        }
    }

    /// Lock contention: a handful of quick exponential retries.
    pub fn for_locks() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            add_jitter: true,
        }
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_backoff.as_millis() as f64;
        let raw = match self.backoff {
            Backoff::Exponential { multiplier } => initial_ms * multiplier.powi(attempt as i32),
            Backoff::Polynomial { exponent } => {
                initial_ms * ((attempt + 1) as f64).powi(exponent as i32)
            }
        };
        let backoff_ms = raw.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            let jitter = (backoff_ms as f64 * 0.25 * rand::thread_rng().gen_range(0.0..1.0)) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }

    /// Whether another attempt is allowed after `attempts_made` failures.
    pub fn should_retry(&self, attempts_made: u32, err: &AppError) -> bool {
        err.is_retryable() && attempts_made <= self.max_retries
    }
}

/// Run `f` until it succeeds, fails permanently, or exhausts `config.max_retries`.
pub async fn retry_async<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    f: F,
) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        code = err.error_code(),
                        error = %err,
                        "Operation failed after max retries"
                    );
                    return Err(err);
                }

                let backoff = config.backoff_duration(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    code = err.error_code(),
                    backoff_ms = backoff.as_millis() as u64,
                    "Operation failed, retrying after backoff"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_doubles() {
        let config = RetryConfig {
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
    }

    #[test]
    fn polynomial_backoff_is_capped() {
        let config = RetryConfig {
            add_jitter: false,
            ..RetryConfig::for_jobs(25)
        };

        assert_eq!(config.backoff_duration(0), Duration::from_secs(15));
        assert_eq!(config.backoff_duration(1), Duration::from_secs(240));
        assert_eq!(config.backoff_duration(20), Duration::from_secs(3600));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = RetryConfig::default();
        for attempt in 0..4 {
            let d = config.backoff_duration(attempt);
            let base = 100u64 * 2u64.pow(attempt);
            assert!(d.as_millis() as u64 >= base);
            assert!(d.as_millis() as u64 <= base + base / 4);
        }
    }

    #[test]
    fn validation_errors_are_never_retried() {
        let config = RetryConfig::default();
        let err = AppError::validation("invalid_threshold", "bad");
        assert!(!config.should_retry(0, &err));
        assert!(config.should_retry(1, &AppError::LockTimeout("x".into())));
        assert!(!config.should_retry(4, &AppError::LockTimeout("x".into())));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(1),
            add_jitter: false,
            ..Default::default()
        };

        let result = retry_async(&config, "flaky", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::LockTimeout("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_returns_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let config = RetryConfig::default();
        let result: Result<(), AppError> = retry_async(&config, "op", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::NotFound(anyhow::anyhow!("wallet")))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
