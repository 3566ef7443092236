//! Deduplication engine
//!
//! Two independent checks:
//! - exact content identity: SHA-256 over the downloaded bytes, claimed
//!   atomically in the store (see `ArtifactStore::record_download`)
//! - fuzzy event families: a signature over bucketed physical parameters, so
//!   near-identical detections from different files share one family

use crate::models::ArtifactKind;
use omnisky_common::{Error, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Chunk size used when hashing files from disk
pub const HASH_CHUNK_BYTES: usize = 1024 * 1024;

/// Hex-encoded SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Incremental SHA-256 for content that arrives in pieces
///
/// Downloaders feed every chunk they write to disk, so the hash is ready the
/// moment the last byte lands.
#[derive(Debug, Clone, Default)]
pub struct StreamingHasher {
    hasher: Sha256,
    bytes: u64,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes fed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Hex digest plus total byte count
    pub fn finalize(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

/// SHA-256 of a file, read in 1 MiB chunks on a blocking thread
pub async fn hash_file(path: &Path) -> Result<String> {
    let path_buf = path.to_path_buf();
    tracing::debug!(path = %path_buf.display(), "Calculating SHA-256 hash");

    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::fs::File;
        use std::io::Read;

        let mut file = File::open(&path_buf).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open {} for hashing: {}", path_buf.display(), e),
            ))
        })?;

        let mut hasher = StreamingHasher::new();
        let mut buffer = vec![0u8; HASH_CHUNK_BYTES];

        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize().0)
    })
    .await
    .map_err(|e| Error::Internal(format!("Hash task panicked: {}", e)))?
}

/// Numeric view of a metadata value; numeric strings are accepted
pub fn value_as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn text_field(metadata: &Map<String, Value>, key: &str) -> Option<String> {
    match metadata.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_field(metadata: &Map<String, Value>, keys: &[&str]) -> f64 {
    keys.iter()
        .find_map(|key| metadata.get(*key).and_then(value_as_f64))
        .unwrap_or(0.0)
}

/// Round `value` to `decimals` places and render it with fixed precision
///
/// `-0.0` (including negatives that round to zero) renders as `0.0`.
fn bucket(value: f64, decimals: i32) -> String {
    let scale = 10f64.powi(decimals);
    let mut rounded = (value * scale).round() / scale;
    if rounded == 0.0 {
        rounded = 0.0;
    }
    format!("{:.*}", decimals as usize, rounded)
}

/// Raw signature text before hashing
pub fn signature_input(kind: ArtifactKind, metadata: &Map<String, Value>) -> String {
    match kind {
        ArtifactKind::Radio => {
            let object = text_field(metadata, "object_name")
                .map(|name| name.to_uppercase())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            let frequency = number_field(metadata, &["frequency", "fch1"]);
            let drift = number_field(metadata, &["drift", "drift_rate"]);
            format!("{}|{}|{}", object, bucket(frequency, 1), bucket(drift, 1))
        }
        ArtifactKind::Image => {
            let ra = number_field(metadata, &["ra"]);
            let dec = number_field(metadata, &["dec"]);
            let epoch = text_field(metadata, "epoch").unwrap_or_else(|| "UNKNOWN".to_string());
            format!("{}|{}|{}", bucket(ra, 2), bucket(dec, 2), epoch)
        }
    }
}

/// Family signature of an event: hex SHA-256 of the bucketed parameters
///
/// Radio: `UPPER(object_name) | frequency to 0.1 MHz | drift to 0.1`.
/// Image: `ra to 0.01° | dec to 0.01° | epoch`.
pub fn signature(kind: ArtifactKind, metadata: &Map<String, Value>) -> String {
    content_hash(signature_input(kind, metadata).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn meta(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_content_hash_known_vector() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut hasher = StreamingHasher::new();
        hasher.update(b"ab");
        hasher.update(b"c");
        assert_eq!(hasher.bytes(), 3);
        assert_eq!(hasher.finalize(), (content_hash(b"abc"), 3));
    }

    #[tokio::test]
    async fn test_hash_file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.fil");
        let payload: Vec<u8> = (0..(HASH_CHUNK_BYTES + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), content_hash(&payload));
    }

    #[tokio::test]
    async fn test_hash_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = hash_file(&dir.path().join("absent")).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_radio_signature_buckets_within_tolerance() {
        let a = meta(json!({"object_name": " voyager-1 ", "frequency": 8419.29, "drift": 0.31}));
        let b = meta(json!({"object_name": "VOYAGER-1", "fch1": 8419.31, "drift_rate": 0.29}));
        let c = meta(json!({"object_name": "VOYAGER-1", "frequency": 8419.5, "drift": 0.3}));

        assert_eq!(signature_input(ArtifactKind::Radio, &a), "VOYAGER-1|8419.3|0.3");
        assert_eq!(signature(ArtifactKind::Radio, &a), signature(ArtifactKind::Radio, &b));
        assert_ne!(signature(ArtifactKind::Radio, &a), signature(ArtifactKind::Radio, &c));
    }

    #[test]
    fn test_image_signature_defaults_and_negative_zero() {
        let empty = Map::new();
        assert_eq!(signature_input(ArtifactKind::Image, &empty), "0.00|0.00|UNKNOWN");

        let near_zero = meta(json!({"ra": -0.001, "dec": "-0.004", "epoch": "1.2"}));
        assert_eq!(signature_input(ArtifactKind::Image, &near_zero), "0.00|0.00|1.2");
    }

    #[test]
    fn test_radio_defaults() {
        let empty = Map::new();
        assert_eq!(signature_input(ArtifactKind::Radio, &empty), "UNKNOWN|0.0|0.0");
    }

    #[test]
    fn test_value_as_f64() {
        assert_eq!(value_as_f64(&json!(1.5)), Some(1.5));
        assert_eq!(value_as_f64(&json!(" 2.25 ")), Some(2.25));
        assert_eq!(value_as_f64(&json!("NaN")), None);
        assert_eq!(value_as_f64(&json!(true)), None);
    }
}
