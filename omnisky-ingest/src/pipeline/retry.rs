//! Download retry strategy
//!
//! Stage logic never sleeps or loops on its own; it asks the configured
//! `RetryPolicy` to run the fallible operation.

use crate::config::RetrySettings;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// One attempt; a failure is final
    #[default]
    SingleAttempt,
    /// Up to `max_attempts` attempts, delays doubling from `base_delay` up to `max_delay`
    ExponentialBackoff {
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    },
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        match *settings {
            RetrySettings::SingleAttempt => RetryPolicy::SingleAttempt,
            RetrySettings::ExponentialBackoff {
                max_attempts,
                base_delay_ms,
                max_delay_ms,
            } => RetryPolicy::ExponentialBackoff {
                max_attempts: max_attempts.max(1),
                base_delay: Duration::from_millis(base_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
            },
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::SingleAttempt => 1,
            RetryPolicy::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }

    /// Wait before attempt `failed_attempts + 1`
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        match self {
            RetryPolicy::SingleAttempt => Duration::ZERO,
            RetryPolicy::ExponentialBackoff {
                base_delay,
                max_delay,
                ..
            } => {
                let exponent = failed_attempts.saturating_sub(1).min(31);
                base_delay
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
            }
        }
    }

    /// Run `operation` until it succeeds, fails with an error `retryable`
    /// rejects, or the attempts are spent
    pub async fn run<T, E, F, Fut, R>(
        &self,
        operation_name: &str,
        mut operation: F,
        retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && retryable(&err) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::ExponentialBackoff {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_from_settings() {
        assert_eq!(RetryPolicy::from(&RetrySettings::SingleAttempt), RetryPolicy::SingleAttempt);
        assert_eq!(
            RetryPolicy::from(&RetrySettings::ExponentialBackoff {
                max_attempts: 3,
                base_delay_ms: 100,
                max_delay_ms: 250
            }),
            RetryPolicy::ExponentialBackoff {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = backoff(10);
        assert_eq!(policy.delay_after(1), Duration::from_millis(1));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2));
        assert_eq!(policy.delay_after(3), Duration::from_millis(4));
        assert_eq!(policy.delay_after(9), Duration::from_millis(4));
        assert_eq!(RetryPolicy::SingleAttempt.delay_after(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_single_attempt_never_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::SingleAttempt
            .run(
                "fetch",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                },
                |_| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = backoff(3)
            .run(
                "fetch",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err("timeout".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_backoff_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = backoff(5)
            .run(
                "fetch",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("404".to_string())
                },
                |e| e != "404",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
