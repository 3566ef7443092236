//! Data models for omnisky-ingest
//!
//! - Discovery targets and artifact kinds
//! - Artifact state machine
//! - Classification results and event rows

pub mod artifact;
pub mod event;
pub mod target;

pub use artifact::{Artifact, ArtifactStatus, DownloadOutcome, Registration};
pub use event::{ClassificationResult, EventDetails, NewEvent, PersistedEvent};
pub use target::{ArtifactKind, Target};
