//! Discovery agent
//!
//! Asks every source plugin for targets, concurrently, and hands back only
//! URLs the store has never seen and the pipeline is not already holding.

use crate::db::ArtifactStore;
use crate::error::IngestResult;
use crate::models::Target;
use crate::observability::Observability;
use crate::pipeline::QueuedUrls;
use crate::sources::SourcePlugin;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Event log type for a plugin whose discovery failed
pub const DISCOVERY_PLUGIN_FAILED: &str = "DISCOVERY_PLUGIN_FAILED";

pub struct DiscoveryAgent {
    plugins: Vec<Arc<dyn SourcePlugin>>,
    store: ArtifactStore,
    observability: Option<Arc<Observability>>,
    queued: Option<QueuedUrls>,
}

impl DiscoveryAgent {
    pub fn new(plugins: Vec<Arc<dyn SourcePlugin>>, store: ArtifactStore) -> Self {
        Self {
            plugins,
            store,
            observability: None,
            queued: None,
        }
    }

    pub fn with_observability(mut self, observability: Arc<Observability>) -> Self {
        self.observability = Some(observability);
        self
    }

    /// Also skip URLs submitted to the pipeline but not registered yet
    pub fn with_queued_urls(mut self, queued: QueuedUrls) -> Self {
        self.queued = Some(queued);
        self
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Targets from every plugin whose URL is neither registered nor queued
    ///
    /// A failing plugin is logged and skipped. Duplicate URLs within the
    /// batch keep their first occurrence, in plugin order.
    pub async fn find_new_targets(&self) -> IngestResult<Vec<Target>> {
        let results = join_all(self.plugins.iter().map(|plugin| async move {
            (plugin.name().to_string(), plugin.discover().await)
        }))
        .await;

        let mut batch = Vec::new();
        for (name, result) in results {
            match result {
                Ok(targets) => {
                    info!(plugin = %name, found = targets.len(), "Plugin discovery finished");
                    batch.extend(targets);
                }
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Plugin discovery failed");
                    if let Some(obs) = &self.observability {
                        obs.log_event(
                            DISCOVERY_PLUGIN_FAILED,
                            json!({ "plugin": name, "error": e.to_string() }),
                        )
                        .await;
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for target in batch {
            if !seen.insert(target.url.clone()) {
                continue;
            }
            if self.queued.as_ref().is_some_and(|q| q.contains(&target.url)) {
                continue;
            }
            if self.store.url_known(&target.url).await? {
                continue;
            }
            fresh.push(target);
        }

        info!(new_targets = fresh.len(), "Discovery round complete");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_store;
    use crate::models::ArtifactKind;
    use crate::sources::PluginError;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct StaticPlugin {
        name: &'static str,
        urls: Vec<&'static str>,
    }

    #[async_trait]
    impl SourcePlugin for StaticPlugin {
        fn name(&self) -> &str {
            self.name
        }
        fn kind(&self) -> Option<ArtifactKind> {
            Some(ArtifactKind::Radio)
        }
        async fn discover(&self) -> Result<Vec<Target>, PluginError> {
            Ok(self
                .urls
                .iter()
                .map(|u| Target::new(*u, ArtifactKind::Radio))
                .collect())
        }
    }

    struct BrokenPlugin;

    #[async_trait]
    impl SourcePlugin for BrokenPlugin {
        fn name(&self) -> &str {
            "BROKEN"
        }
        fn kind(&self) -> Option<ArtifactKind> {
            None
        }
        async fn discover(&self) -> Result<Vec<Target>, PluginError> {
            Err(PluginError::Network("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_batch_and_store_dedup() {
        let (_dir, store) = test_store().await;
        store
            .register(&Target::new("http://a/known.h5", ArtifactKind::Radio))
            .await
            .unwrap();

        let agent = DiscoveryAgent::new(
            vec![
                Arc::new(StaticPlugin {
                    name: "ONE",
                    urls: vec!["http://a/known.h5", "http://a/1.h5", "http://a/2.h5"],
                }),
                Arc::new(StaticPlugin {
                    name: "TWO",
                    urls: vec!["http://a/2.h5", "http://a/3.h5"],
                }),
            ],
            store,
        );

        let urls: Vec<String> = agent
            .find_new_targets()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.url)
            .collect();
        assert_eq!(urls, vec!["http://a/1.h5", "http://a/2.h5", "http://a/3.h5"]);
    }

    #[tokio::test]
    async fn test_queued_urls_are_not_rediscovered() {
        let (_dir, store) = test_store().await;
        let queued = QueuedUrls::default();
        queued.insert("http://a/waiting.h5");

        let agent = DiscoveryAgent::new(
            vec![Arc::new(StaticPlugin {
                name: "ONE",
                urls: vec!["http://a/waiting.h5", "http://a/fresh.h5"],
            })],
            store,
        )
        .with_queued_urls(queued.clone());

        let urls: Vec<String> = agent
            .find_new_targets()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.url)
            .collect();
        assert_eq!(urls, vec!["http://a/fresh.h5"]);

        queued.remove("http://a/waiting.h5");
        assert_eq!(agent.find_new_targets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_plugin_is_isolated() {
        let (_dir, store) = test_store().await;
        let obs_dir = TempDir::new().unwrap();
        let obs = Arc::new(Observability::new(obs_dir.path()));

        let agent = DiscoveryAgent::new(
            vec![
                Arc::new(BrokenPlugin),
                Arc::new(StaticPlugin {
                    name: "OK",
                    urls: vec!["http://a/ok.fil"],
                }),
            ],
            store,
        )
        .with_observability(obs.clone());

        let targets = agent.find_new_targets().await.unwrap();
        assert_eq!(targets.len(), 1);

        let events = obs.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, DISCOVERY_PLUGIN_FAILED);
        assert_eq!(events[0].fields["plugin"], "BROKEN");
    }
}
