//! Database initialization
//!
//! Opens (creating if needed) the SQLite store and brings its schema up to
//! date before any component touches it.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// SQLite busy timeout applied to every pooled connection
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Open the database pool without touching the schema
///
/// Pragmas are set through connect options so that every pooled connection
/// carries them, not only the first one.
pub async fn open_pool(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Initialize database connection and apply pending migrations
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    let pool = open_pool(db_path, 10).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    super::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_database_and_schema() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("omnisky.db");

        let pool = init_database(&db_path).await.unwrap();
        assert!(db_path.exists());

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('artifacts', 'telemetry')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 2);
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("omnisky.db");

        let pool = init_database(&db_path).await.unwrap();
        pool.close().await;

        let pool = init_database(&db_path).await.unwrap();
        let versions = super::super::migrations::applied_versions(&pool).await.unwrap();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced_on_every_connection() {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("omnisky.db")).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO events_radio (artifact_id, timestamp, label, score) VALUES (9999, '2024-01-01T00:00:00.000Z', 'X', 0.0)",
        )
        .execute(&pool)
        .await;
        assert!(result.is_err());
    }
}
