//! VLASS quicklook tiles (image)
//!
//! Tile URLs end in `.../<epoch dir>/<tile>/<image name>.fits`; the image
//! directory is named after the J2000 position, e.g. `J000412+000631`, which
//! gives the RA/Dec used for family grouping.

use super::{PluginError, SourcePlugin};
use crate::config::SourceConfig;
use crate::models::{ArtifactKind, Target};
use async_trait::async_trait;
use regex::Regex;

pub const PLUGIN_ID: &str = "vlass_quicklook";

const DEFAULT_NAME: &str = "VLASS_QUICKLOOK";
const TELESCOPE: &str = "VLA";

/// `Jhhmmss[.s]±ddmmss[.s]`
const TILE_PATTERN: &str =
    r"^J(\d{2})(\d{2})(\d{2}(?:\.\d+)?)([+-])(\d{2})(\d{2})(\d{2}(?:\.\d+)?)$";

const SEEDS: &[&str] = &[
    "https://archive-new.nrao.edu/vlass/quicklook/VLASS1.2/T01t01/J000000+000000/J000000+000000.10.2048.v1.I.iter1.image.pbcor.tt0.subim.fits",
    "https://archive-new.nrao.edu/vlass/quicklook/VLASS1.2/T01t02/J000412+000631/J000412+000631.10.2048.v1.I.iter1.image.pbcor.tt0.subim.fits",
];

pub struct VlassQuicklook {
    name: String,
    targets: Vec<Target>,
}

pub fn build(config: &SourceConfig) -> Result<Box<dyn SourcePlugin>, PluginError> {
    let tile_pattern = Regex::new(TILE_PATTERN).map_err(|e| PluginError::Parse(e.to_string()))?;

    let urls: Vec<String> = if config.urls.is_empty() {
        SEEDS.iter().map(|s| s.to_string()).collect()
    } else {
        config.urls.clone()
    };

    let targets = urls
        .iter()
        .map(|url| tile_target(url, config, &tile_pattern))
        .collect();

    Ok(Box::new(VlassQuicklook {
        name: config.name.clone().unwrap_or_else(|| DEFAULT_NAME.to_string()),
        targets,
    }))
}

/// Path segments of `url` without scheme, host or query
fn segments(url: &str) -> Vec<String> {
    match url::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
            .unwrap_or_default(),
        Err(_) => url
            .split('/')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

/// RA/Dec in degrees from a `Jhhmmss±ddmmss` tile name
pub fn parse_tile_coordinates(pattern: &Regex, tile: &str) -> Option<(f64, f64)> {
    let caps = pattern.captures(tile)?;
    let num = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());

    let ra_hours = num(1)? + num(2)? / 60.0 + num(3)? / 3600.0;
    let dec_abs = num(5)? + num(6)? / 60.0 + num(7)? / 3600.0;
    let sign = if &caps[4] == "-" { -1.0 } else { 1.0 };

    Some((ra_hours * 15.0, sign * dec_abs))
}

fn tile_target(url: &str, config: &SourceConfig, pattern: &Regex) -> Target {
    let parts = segments(url);

    // Directory holding the image is the tile position
    let tile = parts
        .len()
        .checked_sub(2)
        .and_then(|i| parts.get(i))
        .cloned()
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let epoch_dir = parts.iter().find(|p| p.starts_with("VLASS"));
    let dataset = config
        .dataset
        .clone()
        .or_else(|| epoch_dir.cloned())
        .unwrap_or_else(|| "VLASS".to_string());

    let mut target = Target::new(url, ArtifactKind::Image)
        .with_object_name(config.object_name.clone().unwrap_or_else(|| tile.clone()))
        .with_dataset(dataset)
        .with_metadata("telescope", TELESCOPE);

    if let Some(epoch) = epoch_dir.and_then(|d| d.strip_prefix("VLASS")) {
        target = target.with_metadata("epoch", epoch);
    }

    if let Some((ra, dec)) = parse_tile_coordinates(pattern, &tile) {
        target = target.with_metadata("ra", ra).with_metadata("dec", dec);
    }

    target
}

#[async_trait]
impl SourcePlugin for VlassQuicklook {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Option<ArtifactKind> {
        Some(ArtifactKind::Image)
    }

    async fn discover(&self) -> Result<Vec<Target>, PluginError> {
        tracing::debug!(plugin = %self.name, tiles = self.targets.len(), "Listing quicklook tiles");
        Ok(self.targets.clone())
    }
}
