//! Database lock retry
//!
//! Several pipeline workers write concurrently; SQLite serializes writers and
//! answers `SQLITE_BUSY` once its own busy timeout expires. Those errors are
//! retried here with exponential backoff until a total wait budget is spent.

use omnisky_common::{Error, Result};
use std::time::{Duration, Instant};

/// Default total wait budget for one write
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Retries that took longer than this are logged at warn
const SLOW_RECOVERY: Duration = Duration::from_secs(2);

/// Doubling sleep bounded by a deadline
struct LockBackoff {
    started: Instant,
    deadline: Instant,
    next_sleep: Duration,
}

impl LockBackoff {
    fn new(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + budget,
            next_sleep: INITIAL_BACKOFF,
        }
    }

    fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Sleep before the next attempt; `false` once the budget is spent
    async fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let sleep = self.next_sleep.min(self.deadline - now);
        tokio::time::sleep(sleep).await;
        self.next_sleep = (self.next_sleep * 2).min(MAX_BACKOFF);
        true
    }
}

/// Run a store write, retrying while SQLite reports the database locked
///
/// Any other error is returned at once. When `max_wait_ms` runs out the
/// lock error becomes `Error::Internal` naming the operation.
pub async fn retry_on_lock<F, Fut, T>(operation: &str, max_wait_ms: u64, mut attempt_fn: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = LockBackoff::new(Duration::from_millis(max_wait_ms));
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let err = match attempt_fn().await {
            Ok(value) => {
                if attempts > 1 {
                    let elapsed_ms = backoff.elapsed_ms();
                    if backoff.started.elapsed() > SLOW_RECOVERY {
                        tracing::warn!(operation, attempts, elapsed_ms, "Store write went through after a long lock wait");
                    } else {
                        tracing::debug!(operation, attempts, elapsed_ms, "Store write went through after lock retry");
                    }
                }
                return Ok(value);
            }
            Err(err) if err.is_database_locked() => err,
            Err(err) => return Err(err),
        };

        tracing::debug!(operation, attempts, error = %err, "Database locked");
        if !backoff.wait().await {
            let elapsed_ms = backoff.elapsed_ms();
            tracing::error!(operation, attempts, elapsed_ms, max_wait_ms, "Giving up on locked database");
            return Err(Error::Internal(format!(
                "{}: database still locked after {} attempts in {} ms",
                operation, attempts, elapsed_ms
            )));
        }
    }
}
