//! Telemetry samples recorded by the daemon loop on every tick

use super::ArtifactStore;
use crate::error::IngestResult;
use crate::utils::retry_on_lock;
use serde::{Deserialize, Serialize};
use sqlx::Row;

/// One daemon tick: host load, queue occupancy and the resulting state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: String,
    pub session_id: Option<String>,
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub q_download: i64,
    pub q_analyze: i64,
    pub q_persist: i64,
    pub in_flight: i64,
    pub daemon_state: String,
}

impl ArtifactStore {
    pub async fn record_telemetry(&self, sample: &TelemetrySample) -> IngestResult<()> {
        retry_on_lock("record_telemetry", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO telemetry (
                    timestamp, session_id, cpu_pct, ram_pct,
                    q_download, q_analyze, q_persist, in_flight, daemon_state
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&sample.timestamp)
            .bind(&sample.session_id)
            .bind(sample.cpu_pct)
            .bind(sample.ram_pct)
            .bind(sample.q_download)
            .bind(sample.q_analyze)
            .bind(sample.q_persist)
            .bind(sample.in_flight)
            .bind(&sample.daemon_state)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Most recent samples, newest first
    pub async fn recent_telemetry(&self, limit: i64) -> IngestResult<Vec<TelemetrySample>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, session_id, cpu_pct, ram_pct,
                   q_download, q_analyze, q_persist, in_flight, daemon_state
            FROM telemetry
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = Vec::with_capacity(rows.len());
        for row in rows {
            samples.push(TelemetrySample {
                timestamp: row.try_get("timestamp")?,
                session_id: row.try_get("session_id")?,
                cpu_pct: row.try_get("cpu_pct")?,
                ram_pct: row.try_get("ram_pct")?,
                q_download: row.try_get("q_download")?,
                q_analyze: row.try_get("q_analyze")?,
                q_persist: row.try_get("q_persist")?,
                in_flight: row.try_get("in_flight")?,
                daemon_state: row.try_get("daemon_state")?,
            });
        }
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_store;

    fn sample(state: &str, q_download: i64) -> TelemetrySample {
        TelemetrySample {
            timestamp: omnisky_common::time::now_rfc3339(),
            session_id: None,
            cpu_pct: 12.5,
            ram_pct: 40.0,
            q_download,
            q_analyze: 0,
            q_persist: 0,
            in_flight: 1,
            daemon_state: state.to_string(),
        }
    }

    #[tokio::test]
    async fn test_recent_telemetry_newest_first() {
        let (_dir, store) = test_store().await;
        store.record_telemetry(&sample("RUNNING", 1)).await.unwrap();
        store.record_telemetry(&sample("PAUSED", 2)).await.unwrap();
        store.record_telemetry(&sample("IDLE", 3)).await.unwrap();

        let recent = store.recent_telemetry(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].daemon_state, "IDLE");
        assert_eq!(recent[1].q_download, 2);
    }

    #[tokio::test]
    async fn test_telemetry_links_session() {
        let (_dir, store) = test_store().await;
        let session = store.start_session(&serde_json::json!({})).await.unwrap();

        let mut linked = sample("RUNNING", 0);
        linked.session_id = Some(session.to_string());
        store.record_telemetry(&linked).await.unwrap();

        let recent = store.recent_telemetry(1).await.unwrap();
        assert_eq!(recent[0].session_id, Some(session.to_string()));
    }
}
