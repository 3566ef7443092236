//! Error types for omnisky-ingest
//!
//! Collaborator failures (downloader, analyzer, plugins) have their own enums
//! next to their traits; this is the taxonomy the pipeline and store speak.

use crate::models::ArtifactStatus;
use thiserror::Error;

/// Ingest error type
#[derive(Debug, Error)]
pub enum IngestError {
    /// Network or filesystem failure that may succeed on a later attempt
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Analyzer failed or returned nothing usable
    #[error("Analysis failed: {0}")]
    AnalysisFailure(String),

    /// Event row or terminal status could not be written
    #[error("Persist failed: {0}")]
    PersistFailure(String),

    /// Status change not allowed from the artifact's current status
    #[error("Invalid transition for artifact {artifact_id}: {from} -> {to}")]
    InvalidTransition {
        artifact_id: i64,
        from: ArtifactStatus,
        to: ArtifactStatus,
    },

    /// Source plugin construction or discovery failure
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// omnisky-common error
    #[error(transparent)]
    Common(#[from] omnisky_common::Error),
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Common(omnisky_common::Error::Database(err))
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Common(omnisky_common::Error::Io(err))
    }
}

impl From<crate::sources::PluginError> for IngestError {
    fn from(err: crate::sources::PluginError) -> Self {
        IngestError::Plugin(err.to_string())
    }
}

/// Result type for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;
