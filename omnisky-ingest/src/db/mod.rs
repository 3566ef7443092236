//! Durable artifact store
//!
//! `ArtifactStore` owns the SQLite pool and is the only component that writes
//! artifact, event, family, session and telemetry rows. Every write goes
//! through `retry_on_lock`; state changes are conditional updates so a stale
//! worker can never overwrite a newer status.

pub mod artifacts;
pub mod events;
pub mod families;
pub mod sessions;
pub mod telemetry;

pub use artifacts::RecoveryReport;
pub use families::EventFamily;
pub use sessions::{RunSession, SessionStatus};
pub use telemetry::TelemetrySample;

use crate::error::IngestResult;
use crate::utils::DEFAULT_MAX_LOCK_WAIT_MS;
use sqlx::SqlitePool;
use std::path::Path;

/// Handle to the OmniSky database; cheap to clone
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl ArtifactStore {
    /// Wrap a pool whose schema is already migrated
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    /// Open (creating if needed) and migrate the database at `db_path`
    pub async fn open(db_path: &Path) -> IngestResult<Self> {
        let pool = omnisky_common::db::init_database(db_path).await?;
        Ok(Self::new(pool))
    }

    pub fn with_max_lock_wait(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
