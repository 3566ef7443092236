//! Raw file disposal
//!
//! Temp files are removed as soon as the pipeline is done with them so the
//! temp directory never grows. Files whose result could not be stored are
//! moved aside instead.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait Cleanup: Send + Sync {
    /// Delete `path`; failures are logged, never raised
    async fn remove(&self, path: &Path);

    /// Move `path` into the quarantine directory, returning its new location
    async fn quarantine(&self, path: &Path) -> io::Result<PathBuf>;
}

/// Local filesystem cleanup
#[derive(Debug, Clone)]
pub struct FsCleanup {
    quarantine_dir: PathBuf,
}

impl FsCleanup {
    pub fn new(quarantine_dir: impl Into<PathBuf>) -> Self {
        Self {
            quarantine_dir: quarantine_dir.into(),
        }
    }

    fn quarantine_target(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());

        let candidate = self.quarantine_dir.join(&name);
        if !candidate.exists() {
            return candidate;
        }

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        self.quarantine_dir.join(format!("{}_{}", stamp, name))
    }
}

#[async_trait]
impl Cleanup for FsCleanup {
    async fn remove(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed temp file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
        }
    }

    async fn quarantine(&self, path: &Path) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.quarantine_dir).await?;
        let dest = self.quarantine_target(path);

        // rename fails across filesystems; fall back to copy + delete
        if tokio::fs::rename(path, &dest).await.is_err() {
            tokio::fs::copy(path, &dest).await?;
            tokio::fs::remove_file(path).await?;
        }

        tracing::warn!(
            from = %path.display(),
            to = %dest.display(),
            "Raw file quarantined"
        );

        Ok(dest)
    }
}
