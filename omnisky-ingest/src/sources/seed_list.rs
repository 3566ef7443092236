//! Static URL list from configuration

use super::{PluginError, SourcePlugin};
use crate::config::SourceConfig;
use crate::models::{ArtifactKind, Target};
use async_trait::async_trait;

pub const PLUGIN_ID: &str = "seed_list";

const DEFAULT_NAME: &str = "SEED_LIST";

pub struct SeedList {
    name: String,
    kind: Option<ArtifactKind>,
    targets: Vec<Target>,
}

pub fn build(config: &SourceConfig) -> Result<Box<dyn SourcePlugin>, PluginError> {
    let invalid = |message: String| PluginError::InvalidConfig {
        plugin: PLUGIN_ID.to_string(),
        message,
    };

    if config.urls.is_empty() {
        return Err(invalid("urls must not be empty".to_string()));
    }

    let object = config.object_name.clone().unwrap_or_else(|| "UNKNOWN".to_string());
    let dataset = config.dataset.clone().unwrap_or_else(|| DEFAULT_NAME.to_string());

    let mut targets = Vec::with_capacity(config.urls.len());
    for url in &config.urls {
        let kind = config
            .kind
            .or_else(|| ArtifactKind::from_extension(url))
            .ok_or_else(|| invalid(format!("cannot infer kind of {}; set `kind`", url)))?;

        targets.push(
            Target::new(url.clone(), kind)
                .with_object_name(object.clone())
                .with_dataset(dataset.clone()),
        );
    }

    Ok(Box::new(SeedList {
        name: config.name.clone().unwrap_or_else(|| DEFAULT_NAME.to_string()),
        kind: config.kind,
        targets,
    }))
}

#[async_trait]
impl SourcePlugin for SeedList {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Option<ArtifactKind> {
        self.kind
    }

    async fn discover(&self) -> Result<Vec<Target>, PluginError> {
        Ok(self.targets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(urls: &[&str]) -> SourceConfig {
        let mut config = SourceConfig::new(PLUGIN_ID);
        config.urls = urls.iter().map(|u| u.to_string()).collect();
        config
    }

    #[tokio::test]
    async fn test_kinds_inferred_per_url() {
        let plugin = build(&config(&["http://x/a.h5", "http://x/b.fits.gz"])).unwrap();
        let targets = plugin.discover().await.unwrap();

        assert_eq!(plugin.kind(), None);
        assert_eq!(targets[0].kind, ArtifactKind::Radio);
        assert_eq!(targets[1].kind, ArtifactKind::Image);
        assert_eq!(targets[1].dataset_tag, "SEED_LIST");
    }

    #[test]
    fn test_unknown_extension_needs_kind() {
        assert!(matches!(
            build(&config(&["http://x/data.bin"])),
            Err(PluginError::InvalidConfig { .. })
        ));

        let mut fixed = config(&["http://x/data.bin"]);
        fixed.kind = Some(ArtifactKind::Radio);
        assert!(build(&fixed).is_ok());
    }

    #[test]
    fn test_empty_list_rejected() {
        assert!(build(&config(&[])).is_err());
    }
}
