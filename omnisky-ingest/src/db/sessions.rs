//! Daemon run sessions
//!
//! One row per daemon run, carrying the configuration it ran with.

use super::ArtifactStore;
use crate::error::IngestResult;
use crate::utils::retry_on_lock;
use omnisky_common::time::now_rfc3339;
use omnisky_common::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSession {
    pub id: Uuid,
    pub start_time: String,
    pub end_time: Option<String>,
    pub config_snapshot: Value,
    pub status: SessionStatus,
}

impl ArtifactStore {
    /// Open an `ACTIVE` session row
    pub async fn start_session(&self, config_snapshot: &Value) -> IngestResult<Uuid> {
        let id = Uuid::new_v4();
        let id_text = id.to_string();
        let snapshot = config_snapshot.to_string();
        let now = now_rfc3339();

        retry_on_lock("start_session", self.max_lock_wait_ms, || async {
            sqlx::query(
                "INSERT INTO sessions (id, start_time, config_snapshot, status) VALUES (?, ?, ?, 'ACTIVE')",
            )
            .bind(&id_text)
            .bind(&now)
            .bind(&snapshot)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        tracing::info!(session_id = %id, "Run session started");
        Ok(id)
    }

    /// Close a session; closing twice is a no-op
    pub async fn end_session(&self, id: Uuid) -> IngestResult<()> {
        let id_text = id.to_string();
        let now = now_rfc3339();

        retry_on_lock("end_session", self.max_lock_wait_ms, || async {
            sqlx::query(
                "UPDATE sessions SET end_time = ?, status = 'COMPLETED' WHERE id = ? AND status = 'ACTIVE'",
            )
            .bind(&now)
            .bind(&id_text)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        tracing::info!(session_id = %id, "Run session completed");
        Ok(())
    }

    /// Close sessions a crashed process left `ACTIVE`
    pub async fn close_stale_sessions(&self) -> IngestResult<u64> {
        let now = now_rfc3339();
        let closed = retry_on_lock("close_stale_sessions", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                "UPDATE sessions SET end_time = ?, status = 'COMPLETED' WHERE status = 'ACTIVE'",
            )
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if closed > 0 {
            tracing::warn!(closed, "Closed sessions left active by a previous run");
        }
        Ok(closed)
    }

    pub async fn get_session(&self, id: Uuid) -> IngestResult<Option<RunSession>> {
        let row = sqlx::query(
            "SELECT id, start_time, end_time, config_snapshot, status FROM sessions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id_text: String = row.try_get("id")?;
        let snapshot: String = row.try_get("config_snapshot")?;
        let status: String = row.try_get("status")?;

        Ok(Some(RunSession {
            id: Uuid::parse_str(&id_text)
                .map_err(|e| Error::Internal(format!("Invalid session id {}: {}", id_text, e)))?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            config_snapshot: serde_json::from_str(&snapshot).unwrap_or(Value::Null),
            status: if status == "ACTIVE" {
                SessionStatus::Active
            } else {
                SessionStatus::Completed
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_store;
    use serde_json::json;

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (_dir, store) = test_store().await;
        let id = store.start_session(&json!({"pipeline": {"download_workers": 10}})).await.unwrap();

        let active = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(active.status, SessionStatus::Active);
        assert_eq!(active.config_snapshot["pipeline"]["download_workers"], 10);
        assert!(active.end_time.is_none());

        store.end_session(id).await.unwrap();
        let done = store.get_session(id).await.unwrap().unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.end_time.is_some());
    }

    #[tokio::test]
    async fn test_stale_sessions_closed() {
        let (_dir, store) = test_store().await;
        store.start_session(&json!({})).await.unwrap();
        store.start_session(&json!({})).await.unwrap();

        assert_eq!(store.close_stale_sessions().await.unwrap(), 2);
        assert_eq!(store.close_stale_sessions().await.unwrap(), 0);
    }
}
