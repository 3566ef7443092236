//! Breakthrough Listen open data seeds (radio)

use super::{PluginError, SourcePlugin};
use crate::config::SourceConfig;
use crate::models::{ArtifactKind, Target};
use async_trait::async_trait;

pub const PLUGIN_ID: &str = "breakthrough_listen";

const DEFAULT_NAME: &str = "BREAKTHROUGH_LISTEN_OPEN";
const DEFAULT_DATASET: &str = "BL_GBT";

/// Known public samples: (url, object name, center frequency in MHz)
const SEEDS: &[(&str, &str, Option<f64>)] = &[
    (
        "http://bl-open-data.berkeley.edu/sample/voyager_f1093.fil",
        "VOYAGER-1",
        Some(8419.29),
    ),
    (
        "http://blpd1.ssl.berkeley.edu/voyager_2020/sample_data/voyager_f1032_t1334.gpuspec.0000.h5",
        "VOYAGER-1",
        None,
    ),
];

/// Static radio seeds; `urls` in the configuration replace the built-in list
pub struct BreakthroughListen {
    name: String,
    targets: Vec<Target>,
}

pub fn build(config: &SourceConfig) -> Result<Box<dyn SourcePlugin>, PluginError> {
    let dataset = config.dataset.clone().unwrap_or_else(|| DEFAULT_DATASET.to_string());

    let targets = if config.urls.is_empty() {
        SEEDS
            .iter()
            .map(|(url, object, frequency)| {
                let target = Target::new(*url, ArtifactKind::Radio)
                    .with_object_name(*object)
                    .with_dataset(dataset.clone());
                match frequency {
                    Some(mhz) => target
                        .with_metadata("frequency", *mhz)
                        .with_metadata("f_center", *mhz)
                        .with_metadata("bandwidth", 1.0),
                    None => target,
                }
            })
            .collect()
    } else {
        let object = config.object_name.clone().unwrap_or_else(|| "UNKNOWN".to_string());
        config
            .urls
            .iter()
            .map(|url| {
                Target::new(url.clone(), ArtifactKind::Radio)
                    .with_object_name(object.clone())
                    .with_dataset(dataset.clone())
            })
            .collect()
    };

    Ok(Box::new(BreakthroughListen {
        name: config.name.clone().unwrap_or_else(|| DEFAULT_NAME.to_string()),
        targets,
    }))
}

#[async_trait]
impl SourcePlugin for BreakthroughListen {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Option<ArtifactKind> {
        Some(ArtifactKind::Radio)
    }

    async fn discover(&self) -> Result<Vec<Target>, PluginError> {
        Ok(self.targets.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_seeds() {
        let plugin = build(&SourceConfig::new(PLUGIN_ID)).unwrap();
        let targets = plugin.discover().await.unwrap();

        assert_eq!(plugin.name(), DEFAULT_NAME);
        assert_eq!(targets.len(), SEEDS.len());
        assert!(targets.iter().all(|t| t.kind == ArtifactKind::Radio));
        assert_eq!(targets[0].object_name, "VOYAGER-1");
        assert_eq!(targets[0].dataset_tag, "BL_GBT");
        assert_eq!(targets[0].metadata["frequency"], 8419.29);
    }

    #[tokio::test]
    async fn test_configured_urls_replace_seeds() {
        let mut config = SourceConfig::new(PLUGIN_ID);
        config.urls = vec!["http://example.org/hip99.fil".to_string()];
        config.object_name = Some("HIP 99".to_string());

        let targets = build(&config).unwrap().discover().await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].object_name, "HIP 99");
    }
}
