//! Classification results and event rows

use super::target::{ArtifactKind, Target};
use crate::services::dedup;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// What an analyzer reports for one file
///
/// Deserialized directly from the JSON an external analyzer prints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub score: f64,
    pub label: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub evidence_paths: Vec<PathBuf>,
    /// Measured physical parameters (fch1, snr, drift_rate, ra, dec, ...)
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl ClassificationResult {
    pub fn new(label: impl Into<String>, score: f64) -> Self {
        Self {
            score,
            label: label.into(),
            notes: None,
            evidence_paths: Vec::new(),
            metrics: Map::new(),
        }
    }

    /// A result without a label carries no classification
    pub fn is_empty(&self) -> bool {
        self.label.trim().is_empty()
    }
}

/// Kind-specific event columns
#[derive(Debug, Clone, PartialEq)]
pub enum EventDetails {
    Radio {
        fch1: Option<f64>,
        foff: Option<f64>,
        snr: Option<f64>,
        drift_rate: Option<f64>,
    },
    Image {
        ra: Option<f64>,
        dec: Option<f64>,
        annotated_path: Option<String>,
    },
}

/// Event row ready for the persist stage
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub artifact_id: i64,
    pub kind: ArtifactKind,
    pub timestamp: String,
    pub label: String,
    pub score: f64,
    pub notes: Option<String>,
    pub evidence_paths: Vec<String>,
    pub details: EventDetails,
    /// Family signature the event is grouped under
    pub signature: String,
}

/// Identifiers assigned when an event is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedEvent {
    pub event_id: i64,
    pub family_id: String,
    /// First sighting of this signature
    pub new_family: bool,
}

fn lookup_f64(sources: &[&Map<String, Value>], keys: &[&str]) -> Option<f64> {
    sources.iter().find_map(|map| {
        keys.iter()
            .find_map(|key| map.get(*key).and_then(dedup::value_as_f64))
    })
}

impl NewEvent {
    /// Build the event row for `artifact_id` from its target and analyzer output
    ///
    /// Analyzer metrics take precedence over discovery metadata.
    pub fn from_classification(
        artifact_id: i64,
        target: &Target,
        result: &ClassificationResult,
    ) -> Self {
        let sources = [&result.metrics, &target.metadata];

        let details = match target.kind {
            ArtifactKind::Radio => EventDetails::Radio {
                fch1: lookup_f64(&sources, &["fch1", "frequency", "f_center"]),
                foff: lookup_f64(&sources, &["foff"]),
                snr: lookup_f64(&sources, &["snr"]),
                drift_rate: lookup_f64(&sources, &["drift_rate", "drift"]),
            },
            ArtifactKind::Image => EventDetails::Image {
                ra: lookup_f64(&sources, &["ra"]),
                dec: lookup_f64(&sources, &["dec"]),
                annotated_path: result
                    .metrics
                    .get("annotated_path")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
        };

        let mut signature_input = target.signature_metadata();
        for (key, value) in &result.metrics {
            signature_input.insert(key.clone(), value.clone());
        }

        Self {
            artifact_id,
            kind: target.kind,
            timestamp: omnisky_common::time::now_rfc3339(),
            label: result.label.clone(),
            score: result.score,
            notes: result.notes.clone(),
            evidence_paths: result
                .evidence_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            details,
            signature: dedup::signature(target.kind, &signature_input),
        }
    }
}
