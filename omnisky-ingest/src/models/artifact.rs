//! Artifact state machine
//!
//! ```text
//! NEW → DOWNLOADING → {DOWNLOADED | FAILED | DUPLICATE}
//! DOWNLOADED → ANALYZING → {persist queued | FAILED_ANALYSIS}
//! ANALYZING (persist) → {CLEANED | ERROR_ANALYZING}
//! FAILED → NEW   (reclaim on re-submission while file_hash is NULL)
//! ```

use super::target::ArtifactKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Artifact processing status, stored as its SCREAMING_SNAKE_CASE name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    /// Registered, not yet fetched
    New,
    /// Download worker owns it
    Downloading,
    /// Bytes on disk, hash claimed, waiting for analysis
    Downloaded,
    /// Analyzer running, or result waiting in the persist queue
    Analyzing,
    /// Event persisted and raw file removed
    Cleaned,
    /// Content already held by another artifact
    Duplicate,
    /// Download failed
    Failed,
    /// Analyzer failed or returned nothing
    FailedAnalysis,
    /// Result could not be persisted
    ErrorAnalyzing,
}

impl ArtifactStatus {
    pub const ALL: [ArtifactStatus; 9] = [
        ArtifactStatus::New,
        ArtifactStatus::Downloading,
        ArtifactStatus::Downloaded,
        ArtifactStatus::Analyzing,
        ArtifactStatus::Cleaned,
        ArtifactStatus::Duplicate,
        ArtifactStatus::Failed,
        ArtifactStatus::FailedAnalysis,
        ArtifactStatus::ErrorAnalyzing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::New => "NEW",
            ArtifactStatus::Downloading => "DOWNLOADING",
            ArtifactStatus::Downloaded => "DOWNLOADED",
            ArtifactStatus::Analyzing => "ANALYZING",
            ArtifactStatus::Cleaned => "CLEANED",
            ArtifactStatus::Duplicate => "DUPLICATE",
            ArtifactStatus::Failed => "FAILED",
            ArtifactStatus::FailedAnalysis => "FAILED_ANALYSIS",
            ArtifactStatus::ErrorAnalyzing => "ERROR_ANALYZING",
        }
    }

    /// Whether the state machine allows `self → next`
    pub fn can_transition_to(&self, next: ArtifactStatus) -> bool {
        use ArtifactStatus::*;
        matches!(
            (self, next),
            (New, Downloading)
                | (Downloading, Downloaded)
                | (Downloading, Failed)
                | (Downloading, Duplicate)
                | (Downloaded, Analyzing)
                | (Analyzing, FailedAnalysis)
                | (Analyzing, Cleaned)
                | (Analyzing, ErrorAnalyzing)
                | (Failed, New)
        )
    }

    /// No pipeline stage will touch the artifact again
    ///
    /// `FAILED` counts as terminal even though a re-submission may reclaim it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ArtifactStatus::Cleaned
                | ArtifactStatus::Duplicate
                | ArtifactStatus::Failed
                | ArtifactStatus::FailedAnalysis
                | ArtifactStatus::ErrorAnalyzing
        )
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactStatus {
    type Err = omnisky_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                omnisky_common::Error::InvalidInput(format!("Unknown artifact status: {}", s))
            })
    }
}

/// Durable record of one discovered item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub source_url: String,
    pub filename: String,
    pub kind: ArtifactKind,
    pub status: ArtifactStatus,
    pub download_path: Option<String>,
    pub file_hash: Option<String>,
    pub size_bytes: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of registering a target's URL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Fresh row inserted at `NEW`
    Created(i64),
    /// Previously `FAILED` row (no hash) moved back to `NEW`
    Reclaimed(i64),
    /// URL already tracked; the pipeline skips it
    Known { id: i64, status: ArtifactStatus },
}

impl Registration {
    /// Artifact id when the caller now owns the row at `NEW`
    pub fn claimed_id(&self) -> Option<i64> {
        match self {
            Registration::Created(id) | Registration::Reclaimed(id) => Some(*id),
            Registration::Known { .. } => None,
        }
    }
}

/// Outcome of recording downloaded content
///
/// Duplicate content is not an error: the artifact simply ends at `DUPLICATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Hash claimed; artifact is `DOWNLOADED`
    Unique,
    /// Another non-duplicate artifact already holds the hash
    Duplicate { original_id: Option<i64> },
}
