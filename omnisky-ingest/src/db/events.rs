//! Event persistence
//!
//! The persist stage writes the event row, attaches it to its family and
//! moves the artifact to `CLEANED` in a single transaction: either all three
//! happen or none do.

use super::{families, ArtifactStore};
use crate::error::{IngestError, IngestResult};
use crate::models::{ArtifactKind, ArtifactStatus, EventDetails, NewEvent, PersistedEvent};
use crate::utils::{begin_monitored, retry_on_lock};
use omnisky_common::time::now_rfc3339;
use omnisky_common::{Error, Result};
use sqlx::SqliteConnection;

async fn insert_event(conn: &mut SqliteConnection, event: &NewEvent) -> Result<i64> {
    let evidence = serde_json::to_string(&event.evidence_paths)
        .map_err(|e| Error::Internal(format!("Failed to serialize evidence paths: {}", e)))?;

    let result = match &event.details {
        EventDetails::Radio {
            fch1,
            foff,
            snr,
            drift_rate,
        } => {
            sqlx::query(
                r#"
                INSERT INTO events_radio (
                    artifact_id, timestamp, label, score, notes,
                    fch1, foff, snr, drift_rate, evidence_paths
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.artifact_id)
            .bind(&event.timestamp)
            .bind(&event.label)
            .bind(event.score)
            .bind(&event.notes)
            .bind(fch1)
            .bind(foff)
            .bind(snr)
            .bind(drift_rate)
            .bind(&evidence)
            .execute(&mut *conn)
            .await?
        }
        EventDetails::Image {
            ra,
            dec,
            annotated_path,
        } => {
            sqlx::query(
                r#"
                INSERT INTO events_image (
                    artifact_id, timestamp, label, score, notes,
                    ra, dec, annotated_path, evidence_paths
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.artifact_id)
            .bind(&event.timestamp)
            .bind(&event.label)
            .bind(event.score)
            .bind(&event.notes)
            .bind(ra)
            .bind(dec)
            .bind(annotated_path)
            .bind(&evidence)
            .execute(&mut *conn)
            .await?
        }
    };

    Ok(result.last_insert_rowid())
}

fn event_table(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Radio => "events_radio",
        ArtifactKind::Image => "events_image",
    }
}

impl ArtifactStore {
    /// Write `event`, attach its family and mark the artifact `CLEANED`
    ///
    /// Fails with `InvalidTransition` (and writes nothing) unless the
    /// artifact is still `ANALYZING`.
    pub async fn persist_event(&self, event: &NewEvent) -> IngestResult<PersistedEvent> {
        let persisted = retry_on_lock("persist_event", self.max_lock_wait_ms, || {
            self.persist_event_once(event)
        })
        .await?;

        persisted.ok_or(IngestError::InvalidTransition {
            artifact_id: event.artifact_id,
            from: ArtifactStatus::Analyzing,
            to: ArtifactStatus::Cleaned,
        })
    }

    async fn persist_event_once(&self, event: &NewEvent) -> Result<Option<PersistedEvent>> {
        let mut tx = begin_monitored(&self.pool, "persist_event").await?;

        // Status guard first: it takes the write lock before anything is read
        let cleaned = sqlx::query(
            r#"
            UPDATE artifacts
            SET status = 'CLEANED', download_path = NULL, updated_at = ?
            WHERE id = ? AND status = 'ANALYZING'
            "#,
        )
        .bind(now_rfc3339())
        .bind(event.artifact_id)
        .execute(tx.conn()?)
        .await?;

        if cleaned.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let event_id = insert_event(tx.conn()?, event).await?;

        let (family_id, new_family) = families::attach(
            tx.conn()?,
            &event.signature,
            event.kind,
            event_id,
            &event.timestamp,
        )
        .await?;

        sqlx::query(&format!(
            "UPDATE {} SET family_id = ? WHERE id = ?",
            event_table(event.kind)
        ))
        .bind(&family_id)
        .bind(event_id)
        .execute(tx.conn()?)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            artifact_id = event.artifact_id,
            event_id,
            family_id = %family_id,
            new_family,
            "Event persisted"
        );

        Ok(Some(PersistedEvent {
            event_id,
            family_id,
            new_family,
        }))
    }

    /// Events (radio and image) owned by `artifact_id`
    pub async fn count_events_for_artifact(&self, artifact_id: i64) -> IngestResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT (SELECT COUNT(*) FROM events_radio WHERE artifact_id = ?)
                 + (SELECT COUNT(*) FROM events_image WHERE artifact_id = ?)
            "#,
        )
        .bind(artifact_id)
        .bind(artifact_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_events(&self) -> IngestResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM events_radio) + (SELECT COUNT(*) FROM events_image)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Family id of the event owned by `artifact_id`, if any
    pub async fn family_of_artifact(&self, artifact_id: i64) -> IngestResult<Option<String>> {
        let family: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT family_id FROM events_radio WHERE artifact_id = ?
            UNION ALL
            SELECT family_id FROM events_image WHERE artifact_id = ?
            LIMIT 1
            "#,
        )
        .bind(artifact_id)
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(family.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_store;
    use crate::models::{ClassificationResult, Target};
    use crate::services::DownloadedFile;
    use std::path::PathBuf;

    async fn analyzing(store: &ArtifactStore, target: &Target, hash: &str) -> i64 {
        let id = store.register(target).await.unwrap().claimed_id().unwrap();
        store.transition(id, ArtifactStatus::New, ArtifactStatus::Downloading).await.unwrap();
        store
            .record_download(
                id,
                &DownloadedFile {
                    path: PathBuf::from("/tmp/a"),
                    content_hash: hash.to_string(),
                    size_bytes: 1,
                },
            )
            .await
            .unwrap();
        store.transition(id, ArtifactStatus::Downloaded, ArtifactStatus::Analyzing).await.unwrap();
        id
    }

    fn radio(url: &str, frequency: f64) -> Target {
        Target::new(url, ArtifactKind::Radio)
            .with_object_name("VOYAGER-1")
            .with_metadata("frequency", frequency)
    }

    #[tokio::test]
    async fn test_persist_writes_event_family_and_cleans() {
        let (_dir, store) = test_store().await;
        let target = radio("http://x/a.h5", 8419.29);
        let id = analyzing(&store, &target, "ha").await;

        let event = NewEvent::from_classification(id, &target, &ClassificationResult::new("CANDIDATE", 0.9));
        let persisted = store.persist_event(&event).await.unwrap();

        assert!(persisted.new_family);
        assert_eq!(store.count_events_for_artifact(id).await.unwrap(), 1);
        assert_eq!(store.family_of_artifact(id).await.unwrap(), Some(persisted.family_id.clone()));

        let artifact = store.get(id).await.unwrap().unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Cleaned);
        assert!(artifact.download_path.is_none());

        let family = store.family(&persisted.family_id).await.unwrap().unwrap();
        assert_eq!(family.representative_event_id, Some(persisted.event_id));
        assert_eq!(family.member_count, 1);
    }

    #[tokio::test]
    async fn test_similar_events_share_family() {
        let (_dir, store) = test_store().await;
        let first = radio("http://x/a.h5", 8419.29);
        let second = radio("http://x/b.h5", 8419.31);
        let a = analyzing(&store, &first, "ha").await;
        let b = analyzing(&store, &second, "hb").await;

        let result = ClassificationResult::new("CANDIDATE", 0.9);
        let pa = store.persist_event(&NewEvent::from_classification(a, &first, &result)).await.unwrap();
        let pb = store.persist_event(&NewEvent::from_classification(b, &second, &result)).await.unwrap();

        assert_eq!(pa.family_id, pb.family_id);
        assert!(!pb.new_family);
        assert_eq!(store.family_count().await.unwrap(), 1);
        assert_eq!(store.family(&pa.family_id).await.unwrap().unwrap().member_count, 2);
    }

    #[tokio::test]
    async fn test_persist_twice_writes_one_event() {
        let (_dir, store) = test_store().await;
        let target = Target::new("http://x/t.fits", ArtifactKind::Image).with_metadata("ra", 1.0);
        let id = analyzing(&store, &target, "ht").await;
        let event = NewEvent::from_classification(id, &target, &ClassificationResult::new("SOURCE", 0.2));

        store.persist_event(&event).await.unwrap();
        let again = store.persist_event(&event).await;

        assert!(matches!(again, Err(IngestError::InvalidTransition { .. })));
        assert_eq!(store.count_events().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persist_requires_analyzing() {
        let (_dir, store) = test_store().await;
        let target = radio("http://x/a.h5", 1.0);
        let id = store.register(&target).await.unwrap().claimed_id().unwrap();
        let event = NewEvent::from_classification(id, &target, &ClassificationResult::new("X", 0.0));

        assert!(store.persist_event(&event).await.is_err());
        assert_eq!(store.count_events().await.unwrap(), 0);
        assert_eq!(store.family_count().await.unwrap(), 0);
    }
}
