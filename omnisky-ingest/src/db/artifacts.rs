//! Artifact registration and state transitions

use super::ArtifactStore;
use crate::error::{IngestError, IngestResult};
use crate::models::{Artifact, ArtifactStatus, DownloadOutcome, Registration, Target};
use crate::services::DownloadedFile;
use crate::utils::{begin_monitored, retry_on_lock};
use omnisky_common::time::now_rfc3339;
use omnisky_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const ARTIFACT_COLUMNS: &str = "id, source_url, filename, kind, status, download_path, \
     file_hash, size_bytes, last_error, created_at, updated_at";

fn row_to_artifact(row: &SqliteRow) -> Result<Artifact> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;

    Ok(Artifact {
        id: row.try_get("id")?,
        source_url: row.try_get("source_url")?,
        filename: row.try_get("filename")?,
        kind: kind.parse()?,
        status: status.parse()?,
        download_path: row.try_get("download_path")?,
        file_hash: row.try_get("file_hash")?,
        size_bytes: row.try_get("size_bytes")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Rows touched by `recover_interrupted`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `DOWNLOADING` rows now `FAILED` (reclaimable)
    pub downloads_failed: u64,
    /// `DOWNLOADED` / `ANALYZING` rows now `ERROR_ANALYZING`
    pub analyses_abandoned: u64,
}

impl ArtifactStore {
    /// Register a target's URL
    ///
    /// Inserts a `NEW` row, or reclaims a `FAILED` row that never got a hash,
    /// or reports the existing row. The URL is the unique business key, so
    /// concurrent registrations of one URL yield exactly one row.
    pub async fn register(&self, target: &Target) -> IngestResult<Registration> {
        let now = now_rfc3339();
        let filename = target.filename();
        let kind = target.kind.as_str();

        let inserted = retry_on_lock("register_artifact", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT INTO artifacts (source_url, filename, kind, status, created_at, updated_at)
                VALUES (?, ?, ?, 'NEW', ?, ?)
                ON CONFLICT(source_url) DO NOTHING
                "#,
            )
            .bind(&target.url)
            .bind(&filename)
            .bind(kind)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                Ok(Some(result.last_insert_rowid()))
            } else {
                Ok(None)
            }
        })
        .await?;

        if let Some(id) = inserted {
            return Ok(Registration::Created(id));
        }

        let reclaimed = retry_on_lock("reclaim_artifact", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE artifacts
                SET status = 'NEW', last_error = NULL, download_path = NULL, updated_at = ?
                WHERE source_url = ? AND status = 'FAILED' AND file_hash IS NULL
                "#,
            )
            .bind(&now)
            .bind(&target.url)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        let existing = self.find_by_url(&target.url).await?.ok_or_else(|| {
            Error::Internal(format!("Artifact for {} vanished after registration", target.url))
        })?;

        if reclaimed == 1 {
            tracing::info!(artifact_id = existing.id, url = %target.url, "Reclaimed failed artifact");
            Ok(Registration::Reclaimed(existing.id))
        } else {
            Ok(Registration::Known {
                id: existing.id,
                status: existing.status,
            })
        }
    }

    pub async fn get(&self, id: i64) -> IngestResult<Option<Artifact>> {
        let row = sqlx::query(&format!("SELECT {} FROM artifacts WHERE id = ?", ARTIFACT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_artifact).transpose()?)
    }

    pub async fn find_by_url(&self, url: &str) -> IngestResult<Option<Artifact>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM artifacts WHERE source_url = ?",
            ARTIFACT_COLUMNS
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_artifact).transpose()?)
    }

    /// Exact `source_url` lookup used by discovery filtering
    pub async fn url_known(&self, url: &str) -> IngestResult<bool> {
        let known: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM artifacts WHERE source_url = ?)")
                .bind(url)
                .fetch_one(&self.pool)
                .await?;
        Ok(known)
    }

    /// Apply `from → to`, failing if the row is no longer at `from`
    pub async fn transition(
        &self,
        id: i64,
        from: ArtifactStatus,
        to: ArtifactStatus,
    ) -> IngestResult<()> {
        self.apply_transition(id, from, to, None).await
    }

    /// Move to a failure state and record why
    pub async fn mark_failed(
        &self,
        id: i64,
        from: ArtifactStatus,
        to: ArtifactStatus,
        error: &str,
    ) -> IngestResult<()> {
        self.apply_transition(id, from, to, Some(error)).await
    }

    async fn apply_transition(
        &self,
        id: i64,
        from: ArtifactStatus,
        to: ArtifactStatus,
        last_error: Option<&str>,
    ) -> IngestResult<()> {
        if !from.can_transition_to(to) {
            return Err(IngestError::InvalidTransition {
                artifact_id: id,
                from,
                to,
            });
        }

        let now = now_rfc3339();
        let affected = retry_on_lock("artifact_transition", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE artifacts
                SET status = ?, last_error = COALESCE(?, last_error), updated_at = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(to.as_str())
            .bind(last_error)
            .bind(&now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(IngestError::InvalidTransition {
                artifact_id: id,
                from,
                to,
            });
        }

        tracing::debug!(artifact_id = id, from = %from, to = %to, "Artifact transition");
        Ok(())
    }

    /// Claim the downloaded content hash for `id`, or mark it `DUPLICATE`
    ///
    /// The claim is one conditional UPDATE: it succeeds only while the row is
    /// `DOWNLOADING`, its hash is unset or equal, and no other non-duplicate
    /// artifact holds the same hash. SQLite serializes writers, so two
    /// artifacts racing for the same bytes cannot both win.
    pub async fn record_download(
        &self,
        id: i64,
        file: &DownloadedFile,
    ) -> IngestResult<DownloadOutcome> {
        let now = now_rfc3339();
        let hash = file.content_hash.as_str();
        let path = file.path.display().to_string();
        let size = file.size_bytes as i64;

        let claimed = retry_on_lock("claim_hash", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE artifacts
                SET status = 'DOWNLOADED', file_hash = ?, download_path = ?, size_bytes = ?, updated_at = ?
                WHERE id = ?
                  AND status = 'DOWNLOADING'
                  AND (file_hash IS NULL OR file_hash = ?)
                  AND NOT EXISTS (
                      SELECT 1 FROM artifacts other
                      WHERE other.file_hash = ? AND other.id != ? AND other.status != 'DUPLICATE'
                  )
                "#,
            )
            .bind(hash)
            .bind(&path)
            .bind(size)
            .bind(&now)
            .bind(id)
            .bind(hash)
            .bind(hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if claimed == 1 {
            return Ok(DownloadOutcome::Unique);
        }

        let marked = retry_on_lock("mark_duplicate", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE artifacts
                SET status = 'DUPLICATE', file_hash = COALESCE(file_hash, ?), size_bytes = ?,
                    download_path = NULL, updated_at = ?
                WHERE id = ? AND status = 'DOWNLOADING'
                "#,
            )
            .bind(hash)
            .bind(size)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if marked == 0 {
            return Err(IngestError::InvalidTransition {
                artifact_id: id,
                from: ArtifactStatus::Downloading,
                to: ArtifactStatus::Duplicate,
            });
        }

        let original_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM artifacts
            WHERE file_hash = ? AND id != ? AND status != 'DUPLICATE'
            ORDER BY id LIMIT 1
            "#,
        )
        .bind(hash)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(DownloadOutcome::Duplicate { original_id })
    }

    pub async fn count_by_status(&self, status: ArtifactStatus) -> IngestResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Row count per status, statuses without rows omitted
    pub async fn status_counts(&self) -> IngestResult<Vec<(ArtifactStatus, i64)>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM artifacts GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<(ArtifactStatus, i64)> {
                let status: String = row.try_get("status")?;
                let count: i64 = row.try_get("n")?;
                Ok((status.parse::<ArtifactStatus>()?, count))
            })
            .collect::<Result<Vec<_>>>()
            .map_err(IngestError::from)
    }

    /// Settle rows left mid-pipeline by a previous process
    ///
    /// Must run before any pipeline starts. Downloads become reclaimable
    /// `FAILED`; downloaded or analyzing rows take the legal path
    /// `DOWNLOADED → ANALYZING → ERROR_ANALYZING`.
    pub async fn recover_interrupted(&self) -> IngestResult<RecoveryReport> {
        let now = now_rfc3339();
        let mut tx = begin_monitored(&self.pool, "recover_interrupted").await?;

        let downloads_failed = sqlx::query(
            r#"
            UPDATE artifacts
            SET status = 'FAILED', last_error = 'interrupted during download',
                download_path = NULL, updated_at = ?
            WHERE status = 'DOWNLOADING'
            "#,
        )
        .bind(&now)
        .execute(tx.conn()?)
        .await?
        .rows_affected();

        sqlx::query("UPDATE artifacts SET status = 'ANALYZING', updated_at = ? WHERE status = 'DOWNLOADED'")
            .bind(&now)
            .execute(tx.conn()?)
            .await?;

        let analyses_abandoned = sqlx::query(
            r#"
            UPDATE artifacts
            SET status = 'ERROR_ANALYZING', last_error = 'interrupted before persist',
                download_path = NULL, updated_at = ?
            WHERE status = 'ANALYZING'
            "#,
        )
        .bind(&now)
        .execute(tx.conn()?)
        .await?
        .rows_affected();

        tx.commit().await?;

        let report = RecoveryReport {
            downloads_failed,
            analyses_abandoned,
        };
        if report != RecoveryReport::default() {
            tracing::warn!(
                downloads_failed,
                analyses_abandoned,
                "Recovered artifacts interrupted by previous run"
            );
        }
        Ok(report)
    }
}
