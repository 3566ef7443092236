//! Discovery targets

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Kind of dataset an artifact carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArtifactKind {
    /// Filterbank / HDF5 spectrograms (`.h5`, `.fil`)
    Radio,
    /// FITS images (`.fits`, `.fits.gz`)
    Image,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Radio => "RADIO",
            ArtifactKind::Image => "IMAGE",
        }
    }

    /// Infer the kind from a file name or URL path
    ///
    /// Query strings are ignored. Returns `None` for unknown extensions.
    pub fn from_extension(name: &str) -> Option<Self> {
        let path = name.split(['?', '#']).next().unwrap_or(name).to_ascii_lowercase();
        if path.ends_with(".fits") || path.ends_with(".fits.gz") || path.ends_with(".fit") {
            Some(ArtifactKind::Image)
        } else if path.ends_with(".h5") || path.ends_with(".fil") {
            Some(ArtifactKind::Radio)
        } else {
            None
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = omnisky_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RADIO" => Ok(ArtifactKind::Radio),
            "IMAGE" => Ok(ArtifactKind::Image),
            other => Err(omnisky_common::Error::InvalidInput(format!(
                "Unknown artifact kind: {}",
                other
            ))),
        }
    }
}

/// A remote dataset proposed by a source plugin
///
/// Immutable once produced; it has no identity until the pipeline registers
/// it as an artifact keyed by `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub url: String,
    pub kind: ArtifactKind,
    pub object_name: String,
    pub dataset_tag: String,
    /// Free-form physical parameters (frequency, ra, dec, epoch, ...)
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Target {
    pub fn new(url: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            url: url.into(),
            kind,
            object_name: "UNKNOWN".to_string(),
            dataset_tag: String::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_object_name(mut self, name: impl Into<String>) -> Self {
        self.object_name = name.into();
        self
    }

    pub fn with_dataset(mut self, tag: impl Into<String>) -> Self {
        self.dataset_tag = tag.into();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Last path segment of the URL, without query string
    ///
    /// Characters outside `[A-Za-z0-9._-]` are replaced so the result is a
    /// safe file name on every platform.
    pub fn filename(&self) -> String {
        let segment = match url::Url::parse(&self.url) {
            Ok(parsed) => parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
                .unwrap_or_default(),
            Err(_) => self
                .url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        };

        let cleaned: String = segment
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        if cleaned.trim_matches(['.', '_']).is_empty() {
            "artifact".to_string()
        } else {
            cleaned
        }
    }

    /// Name of this target's file in the temp directory
    ///
    /// `<first 12 hex chars of sha256(url)>_<filename>`: unique per URL, so
    /// two targets sharing a basename never collide.
    pub fn temp_file_name(&self) -> String {
        let digest = crate::services::dedup::content_hash(self.url.as_bytes());
        format!("{}_{}", &digest[..12], self.filename())
    }

    /// Metadata merged with the object name, as fed to the family signature
    pub fn signature_metadata(&self) -> Map<String, Value> {
        let mut merged = self.metadata.clone();
        merged
            .entry("object_name".to_string())
            .or_insert_with(|| Value::String(self.object_name.clone()));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(ArtifactKind::from_extension("a/b/c.h5"), Some(ArtifactKind::Radio));
        assert_eq!(ArtifactKind::from_extension("x.FIL"), Some(ArtifactKind::Radio));
        assert_eq!(ArtifactKind::from_extension("tile.fits"), Some(ArtifactKind::Image));
        assert_eq!(ArtifactKind::from_extension("tile.fits.gz?x=1"), Some(ArtifactKind::Image));
        assert_eq!(ArtifactKind::from_extension("readme.txt"), None);
    }

    #[test]
    fn test_kind_parse_and_serde() {
        assert_eq!("radio".parse::<ArtifactKind>().unwrap(), ArtifactKind::Radio);
        assert!("SPECTRUM".parse::<ArtifactKind>().is_err());
        assert_eq!(serde_json::to_string(&ArtifactKind::Image).unwrap(), "\"IMAGE\"");
    }

    #[test]
    fn test_filename_strips_query() {
        let target = Target::new(
            "http://example.org/data/voyager_f1032.h5?sim=1234",
            ArtifactKind::Radio,
        );
        assert_eq!(target.filename(), "voyager_f1032.h5");
    }

    #[test]
    fn test_filename_fallbacks() {
        let dir = Target::new("http://example.org/data/", ArtifactKind::Radio);
        assert_eq!(dir.filename(), "artifact");

        let odd = Target::new("not a url/with space.fits", ArtifactKind::Image);
        assert_eq!(odd.filename(), "with_space.fits");
    }

    #[test]
    fn test_temp_file_name_unique_per_url() {
        let a = Target::new("http://a.org/x/data.h5", ArtifactKind::Radio);
        let b = Target::new("http://b.org/y/data.h5", ArtifactKind::Radio);

        assert_ne!(a.temp_file_name(), b.temp_file_name());
        assert!(a.temp_file_name().ends_with("_data.h5"));
        assert_eq!(a.temp_file_name().split('_').next().map(str::len), Some(12));
    }

    #[test]
    fn test_signature_metadata_keeps_explicit_name() {
        let target = Target::new("http://x/a.h5", ArtifactKind::Radio)
            .with_object_name("VOYAGER-1")
            .with_metadata("object_name", "OVERRIDE");
        assert_eq!(target.signature_metadata()["object_name"], "OVERRIDE");

        let plain = Target::new("http://x/b.h5", ArtifactKind::Radio).with_object_name("HIP 1");
        assert_eq!(plain.signature_metadata()["object_name"], "HIP 1");
    }
}
