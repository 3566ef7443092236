//! Classification stage collaborators
//!
//! The pipeline treats classification as a black box: a file path goes in,
//! a `ClassificationResult` (or an error) comes out.

use crate::models::{ArtifactKind, ClassificationResult};
use async_trait::async_trait;
use serde_json::{json, Map};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;

/// Label reported when no analyzer is configured
pub const UNCLASSIFIED_LABEL: &str = "UNCLASSIFIED";

/// Analyzer errors
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Analyzer produced no result")]
    EmptyResult,

    #[error("Analyzer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Analyzer exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("Analyzer output is not a valid result: {0}")]
    InvalidOutput(String),

    #[error("Analyzer panicked: {0}")]
    Panicked(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classifies one downloaded file
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        kind: ArtifactKind,
        path: &Path,
    ) -> Result<ClassificationResult, AnalyzeError>;
}

/// Runs an external program per file and reads JSON from its stdout
///
/// Invocation: `<program> [args...] <KIND> <PATH>`. The program prints one
/// JSON object shaped like `ClassificationResult`, or `null` / nothing when it
/// has no result.
pub struct CommandAnalyzer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(
        &self,
        kind: ArtifactKind,
        path: &Path,
    ) -> Result<ClassificationResult, AnalyzeError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .arg(kind.as_str())
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            program = %self.program.display(),
            path = %path.display(),
            "Running analyzer"
        );

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| AnalyzeError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AnalyzeError::Failed {
                code: output.status.code(),
                stderr: stderr.trim().chars().take(500).collect(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Err(AnalyzeError::EmptyResult);
        }

        let parsed: Option<ClassificationResult> = serde_json::from_str(stdout)
            .map_err(|e| AnalyzeError::InvalidOutput(e.to_string()))?;

        match parsed {
            Some(result) if !result.is_empty() => Ok(result),
            _ => Err(AnalyzeError::EmptyResult),
        }
    }
}

/// Records every file as `UNCLASSIFIED`
///
/// Used when no analyzer command is configured so the pipeline still
/// registers, deduplicates and cleans up what it downloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughAnalyzer;

#[async_trait]
impl Analyzer for PassthroughAnalyzer {
    async fn analyze(
        &self,
        kind: ArtifactKind,
        path: &Path,
    ) -> Result<ClassificationResult, AnalyzeError> {
        let metadata = tokio::fs::metadata(path).await?;

        let mut metrics = Map::new();
        metrics.insert("size_bytes".to_string(), json!(metadata.len()));

        Ok(ClassificationResult {
            score: 0.0,
            label: UNCLASSIFIED_LABEL.to_string(),
            notes: Some(format!("{} file recorded without analysis", kind)),
            evidence_paths: Vec::new(),
            metrics,
        })
    }
}
