//! Connection pool monitoring
//!
//! Instrumented transactions that log how long a connection was waited for
//! and held, to spot pool saturation under concurrent persist workers.

use omnisky_common::{Error, Result};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::time::Instant;

/// Transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction<'c> {
    tx: Option<Transaction<'c, Sqlite>>,
    caller: &'static str,
    acquired_at: Instant,
}

impl<'c> MonitoredTransaction<'c> {
    fn consumed(&self) -> Error {
        Error::Internal(format!("{}: transaction already consumed", self.caller))
    }

    /// Commit and log how long the connection was held
    pub async fn commit(mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| self.consumed())?;
        tx.commit().await?;
        self.log_release("commit");
        Ok(())
    }

    /// Roll back and log how long the connection was held
    pub async fn rollback(mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| self.consumed())?;
        tx.rollback().await?;
        self.log_release("rollback");
        Ok(())
    }

    /// Connection to run statements on
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        let caller = self.caller;
        self.tx
            .as_deref_mut()
            .ok_or_else(|| Error::Internal(format!("{}: transaction already consumed", caller)))
    }

    fn log_release(&self, how: &'static str) {
        let held_ms = self.acquired_at.elapsed().as_millis();
        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                how,
                "LONG TRANSACTION - connection held for extended period"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, how, "Connection released");
        }
    }
}

impl<'c> Drop for MonitoredTransaction<'c> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            // sqlx rolls back an unfinished transaction on drop
            self.log_release("drop");
        }
    }
}

/// Begin a transaction, logging slow connection acquisition
pub async fn begin_monitored<'c>(
    pool: &'c SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction<'c>> {
    let start = Instant::now();
    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW CONNECTION ACQUISITION - pool may be saturated"
        );
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx: Some(tx),
        caller,
        acquired_at: Instant::now(),
    })
}
