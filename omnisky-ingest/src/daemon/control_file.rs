//! Operator control file (`control.json`)
//!
//! Written by `omnisky-ingest pause|resume`, read by the daemon every cycle.
//! A missing or unreadable file means "run".

use crate::error::IngestResult;
use omnisky_common::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DesiredState {
    #[default]
    Running,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFile {
    pub desired_state: DesiredState,
    #[serde(default)]
    pub reason: String,
    /// When pausing: let items already queued run through (`true`) or stop
    /// pulling new queue items at once (`false`)
    #[serde(default = "default_finish_current_job")]
    pub finish_current_job: bool,
    #[serde(default)]
    pub updated_at: String,
}

fn default_finish_current_job() -> bool {
    true
}

impl Default for ControlFile {
    fn default() -> Self {
        Self::running()
    }
}

impl ControlFile {
    pub fn running() -> Self {
        Self {
            desired_state: DesiredState::Running,
            reason: String::new(),
            finish_current_job: true,
            updated_at: now_rfc3339(),
        }
    }

    pub fn paused(reason: impl Into<String>, finish_current_job: bool) -> Self {
        Self {
            desired_state: DesiredState::Paused,
            reason: reason.into(),
            finish_current_job,
            updated_at: now_rfc3339(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.desired_state == DesiredState::Paused
    }

    /// Read `path`; missing file means running, a malformed one is logged and ignored
    pub async fn read(path: &Path) -> Self {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Cannot read control file");
                }
                return Self::running();
            }
        };

        match serde_json::from_slice(&content) {
            Ok(control) => control,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Malformed control file, ignoring");
                Self::running()
            }
        }
    }

    /// Write atomically (temp file + rename)
    pub async fn write(&self, path: &Path) -> IngestResult<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| {
            omnisky_common::Error::Internal(format!("Failed to serialize control file: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}
