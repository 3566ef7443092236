//! Database schema migrations
//!
//! Versioned, ordered schema migrations tracked in `schema_migrations`.
//!
//! # Migration Guidelines
//!
//! 1. **Never modify existing migrations** - databases in the field already applied them
//! 2. **Always add new migrations** - append a new entry with the next version number
//! 3. **One transaction per migration** - a failing statement rolls the whole version back
//! 4. **Versions strictly increase** - `run_migrations` refuses an unordered list
//!
//! A migration error is fatal: callers must not use a store whose schema is
//! partially applied.

use crate::{Error, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};

/// One schema migration step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Migrations for the OmniSky store, in application order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "artifacts_events_families",
        sql: r#"
        CREATE TABLE IF NOT EXISTS artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_url TEXT NOT NULL UNIQUE,
            filename TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            download_path TEXT,
            file_hash TEXT,
            size_bytes INTEGER,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_artifacts_file_hash ON artifacts(file_hash);
        CREATE INDEX IF NOT EXISTS idx_artifacts_status ON artifacts(status);

        CREATE TABLE IF NOT EXISTS event_families (
            id TEXT PRIMARY KEY,
            signature_hash TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            representative_event_id INTEGER
        );

        CREATE TABLE IF NOT EXISTS events_radio (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_id INTEGER NOT NULL UNIQUE REFERENCES artifacts(id),
            family_id TEXT REFERENCES event_families(id),
            timestamp TEXT NOT NULL,
            label TEXT NOT NULL,
            score REAL NOT NULL,
            notes TEXT,
            fch1 REAL,
            foff REAL,
            snr REAL,
            drift_rate REAL,
            evidence_paths TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_events_radio_family ON events_radio(family_id);

        CREATE TABLE IF NOT EXISTS events_image (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_id INTEGER NOT NULL UNIQUE REFERENCES artifacts(id),
            family_id TEXT REFERENCES event_families(id),
            timestamp TEXT NOT NULL,
            label TEXT NOT NULL,
            score REAL NOT NULL,
            notes TEXT,
            ra REAL,
            dec REAL,
            annotated_path TEXT,
            evidence_paths TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_events_image_family ON events_image(family_id);
        "#,
    },
    Migration {
        version: 2,
        name: "sessions_telemetry",
        sql: r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            start_time TEXT NOT NULL,
            end_time TEXT,
            config_snapshot TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS telemetry (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            session_id TEXT REFERENCES sessions(id),
            cpu_pct REAL NOT NULL,
            ram_pct REAL NOT NULL,
            q_download INTEGER NOT NULL,
            q_analyze INTEGER NOT NULL,
            q_persist INTEGER NOT NULL,
            in_flight INTEGER NOT NULL,
            daemon_state TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_telemetry_timestamp ON telemetry(timestamp);
        "#,
    },
];

/// Highest schema version known to this build
pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Versions already recorded in `schema_migrations`, ascending
pub async fn applied_versions(pool: &SqlitePool) -> Result<Vec<i64>> {
    create_migrations_table(pool).await?;

    let versions: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(pool)
            .await?;

    Ok(versions)
}

fn check_ordering(migrations: &[Migration]) -> Result<()> {
    for pair in migrations.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(Error::Config(format!(
                "Migrations out of order: v{} ({}) follows v{} ({})",
                pair[1].version, pair[1].name, pair[0].version, pair[0].name
            )));
        }
    }
    Ok(())
}

/// Run all pending migrations of the OmniSky schema
pub async fn run_migrations(pool: &SqlitePool) -> Result<usize> {
    apply_migrations(pool, MIGRATIONS).await
}

/// Apply `migrations` in order, each at most once and atomically
///
/// Returns the number of migrations applied by this call.
pub async fn apply_migrations(pool: &SqlitePool, migrations: &[Migration]) -> Result<usize> {
    check_ordering(migrations)?;

    let applied = applied_versions(pool).await?;
    let known_max = migrations.last().map(|m| m.version).unwrap_or(0);

    if let Some(&db_max) = applied.last() {
        if db_max > known_max {
            warn!(
                "Database schema version ({}) is newer than code version ({})",
                db_max, known_max
            );
            warn!("This may indicate a downgrade. Proceeding with caution.");
        }
    }

    let pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();

    if pending.is_empty() {
        info!("Database schema is up to date (v{})", known_max);
        return Ok(0);
    }

    for migration in &pending {
        info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );

        let fail = |e: sqlx::Error| Error::Migration {
            version: migration.version,
            message: e.to_string(),
        };

        let mut tx = pool.begin().await?;

        // raw_sql runs every statement of the script on the transaction's connection
        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(fail)?;

        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(migration.version)
            .bind(crate::time::now_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(fail)?;

        tx.commit().await.map_err(fail)?;

        info!("✓ Migration v{} ({}) completed", migration.version, migration.name);
    }

    info!("All migrations completed successfully");
    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    // Single connection: every connection to sqlite::memory: is a separate database
    async fn setup_test_db() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?)",
        )
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_database_applies_everything() {
        let pool = setup_test_db().await;

        let applied = run_migrations(&pool).await.unwrap();
        assert_eq!(applied, MIGRATIONS.len());

        for table in ["artifacts", "events_radio", "events_image", "event_families", "sessions", "telemetry"] {
            assert!(table_exists(&pool, table).await, "missing table {}", table);
        }

        let versions = applied_versions(&pool).await.unwrap();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_second_run_is_noop() {
        let pool = setup_test_db().await;
        run_migrations(&pool).await.unwrap();

        let applied = run_migrations(&pool).await.unwrap();
        assert_eq!(applied, 0);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, MIGRATIONS.len() as i64);
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back() {
        let pool = setup_test_db().await;
        let broken = [
            Migration {
                version: 1,
                name: "ok",
                sql: "CREATE TABLE first_table (id INTEGER PRIMARY KEY);",
            },
            Migration {
                version: 2,
                name: "broken",
                sql: "CREATE TABLE half_done (id INTEGER PRIMARY KEY); THIS IS NOT SQL;",
            },
        ];

        let result = apply_migrations(&pool, &broken).await;
        assert!(matches!(result, Err(Error::Migration { version: 2, .. })));

        assert!(table_exists(&pool, "first_table").await);
        assert!(!table_exists(&pool, "half_done").await);
        assert_eq!(applied_versions(&pool).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_unordered_list_rejected() {
        let pool = setup_test_db().await;
        let unordered = [
            Migration { version: 2, name: "b", sql: "SELECT 1;" },
            Migration { version: 1, name: "a", sql: "SELECT 1;" },
        ];

        let result = apply_migrations(&pool, &unordered).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(applied_versions(&pool).await.unwrap().is_empty());
    }

    #[test]
    fn test_builtin_migrations_are_ordered() {
        assert!(check_ordering(MIGRATIONS).is_ok());
        assert_eq!(current_schema_version(), 2);
    }
}
