//! Event families
//!
//! Events whose bucketed physical parameters match share one family row,
//! created lazily on first sighting.

use super::ArtifactStore;
use crate::error::IngestResult;
use crate::models::ArtifactKind;
use omnisky_common::Result;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// A group of events sharing a signature
#[derive(Debug, Clone, PartialEq)]
pub struct EventFamily {
    pub id: String,
    pub signature_hash: String,
    pub kind: ArtifactKind,
    pub first_seen_at: String,
    pub representative_event_id: Option<i64>,
    pub member_count: i64,
}

/// Get or create the family for `signature` inside the caller's transaction
///
/// Returns the family id and whether this call created it. The first event
/// of a family becomes its representative.
pub(crate) async fn attach(
    conn: &mut SqliteConnection,
    signature: &str,
    kind: ArtifactKind,
    event_id: i64,
    seen_at: &str,
) -> Result<(String, bool)> {
    let candidate = Uuid::new_v4().to_string();

    let inserted = sqlx::query(
        r#"
        INSERT INTO event_families (id, signature_hash, kind, first_seen_at, representative_event_id)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(signature_hash) DO NOTHING
        "#,
    )
    .bind(&candidate)
    .bind(signature)
    .bind(kind.as_str())
    .bind(seen_at)
    .bind(event_id)
    .execute(&mut *conn)
    .await?;

    if inserted.rows_affected() == 1 {
        return Ok((candidate, true));
    }

    let existing: String =
        sqlx::query_scalar("SELECT id FROM event_families WHERE signature_hash = ?")
            .bind(signature)
            .fetch_one(&mut *conn)
            .await?;

    Ok((existing, false))
}

impl ArtifactStore {
    pub async fn family(&self, id: &str) -> IngestResult<Option<EventFamily>> {
        let row = sqlx::query(
            r#"
            SELECT f.id, f.signature_hash, f.kind, f.first_seen_at, f.representative_event_id,
                   (SELECT COUNT(*) FROM events_radio r WHERE r.family_id = f.id)
                 + (SELECT COUNT(*) FROM events_image i WHERE i.family_id = f.id) AS member_count
            FROM event_families f
            WHERE f.id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let kind: String = row.try_get("kind")?;
        Ok(Some(EventFamily {
            id: row.try_get("id")?,
            signature_hash: row.try_get("signature_hash")?,
            kind: kind.parse()?,
            first_seen_at: row.try_get("first_seen_at")?,
            representative_event_id: row.try_get("representative_event_id")?,
            member_count: row.try_get("member_count")?,
        }))
    }

    pub async fn family_count(&self) -> IngestResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_families")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
