//! Source plugins
//!
//! A source plugin proposes `Target`s; it never touches the store or the
//! pipeline. Plugins are built from `[[sources]]` entries through an explicit
//! `PluginRegistry` populated at startup.

pub mod breakthrough_listen;
pub mod index_scraper;
pub mod seed_list;
pub mod vlass_quicklook;

use crate::config::SourceConfig;
use crate::models::{ArtifactKind, Target};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Source plugin errors
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Unknown source plugin: {0}")]
    UnknownPlugin(String),

    #[error("Invalid configuration for {plugin}: {message}")]
    InvalidConfig { plugin: String, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for PluginError {
    fn from(err: reqwest::Error) -> Self {
        PluginError::Network(err.to_string())
    }
}

/// A catalog that can be asked for datasets to harvest
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Name used in logs and the event log
    fn name(&self) -> &str;

    /// Kind of every target this plugin yields; `None` when it yields both
    fn kind(&self) -> Option<ArtifactKind>;

    async fn discover(&self) -> Result<Vec<Target>, PluginError>;
}

/// Builds a plugin from its configuration entry
pub type PluginConstructor = fn(&SourceConfig) -> Result<Box<dyn SourcePlugin>, PluginError>;

/// Plugin identifier → constructor
pub struct PluginRegistry {
    constructors: BTreeMap<String, PluginConstructor>,
}

impl PluginRegistry {
    /// Registry with no plugins; `Default` gives the built-in set
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry holding every built-in plugin
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(index_scraper::PLUGIN_ID, index_scraper::build);
        registry.register(breakthrough_listen::PLUGIN_ID, breakthrough_listen::build);
        registry.register(vlass_quicklook::PLUGIN_ID, vlass_quicklook::build);
        registry.register(seed_list::PLUGIN_ID, seed_list::build);
        registry
    }

    /// Add or replace the constructor for `id`
    pub fn register(&mut self, id: &str, constructor: PluginConstructor) {
        self.constructors.insert(id.to_string(), constructor);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn build(&self, config: &SourceConfig) -> Result<Box<dyn SourcePlugin>, PluginError> {
        let constructor = self
            .constructors
            .get(&config.id)
            .ok_or_else(|| PluginError::UnknownPlugin(config.id.clone()))?;
        constructor(config)
    }

    /// Build every enabled entry; the first unknown or invalid entry fails all
    pub fn build_all(
        &self,
        configs: &[SourceConfig],
    ) -> Result<Vec<Arc<dyn SourcePlugin>>, PluginError> {
        let mut plugins: Vec<Arc<dyn SourcePlugin>> = Vec::new();
        for config in configs {
            if !config.enabled {
                tracing::info!(plugin = %config.id, "Source disabled in configuration");
                continue;
            }
            let plugin = self.build(config)?;
            tracing::info!(plugin = %config.id, name = plugin.name(), "Source plugin loaded");
            plugins.push(Arc::from(plugin));
        }
        Ok(plugins)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
