//! Configuration for omnisky-ingest
//!
//! One TOML file, every section optional:
//!
//! ```toml
//! root_folder = "/data/omnisky"
//!
//! [logging]
//! level = "info"
//!
//! [pipeline]
//! download_workers = 10
//! analyze_workers = 5
//! persist_workers = 2
//!
//! [pipeline.retry]
//! strategy = "exponential_backoff"
//! max_attempts = 3
//!
//! [daemon]
//! cpu_threshold = 85.0
//! heavy_processes = ["blender", "steam"]
//!
//! [analyzer]
//! command = "/usr/local/bin/omnisky-classify"
//!
//! [[sources]]
//! id = "index_scraper"
//! urls = ["http://blpd0.ssl.berkeley.edu/voyager/"]
//! ```

use crate::error::{IngestError, IngestResult};
use crate::models::ArtifactKind;
use omnisky_common::config::{load_toml_config, locate_config_file};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the analyzer program
pub const ANALYZER_ENV_VAR: &str = "OMNISKY_ANALYZER_COMMAND";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Root folder (database, temp cache, observability files)
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingSettings,
    pub pipeline: PipelineSettings,
    pub daemon: DaemonSettings,
    pub analyzer: AnalyzerSettings,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub download_workers: usize,
    pub analyze_workers: usize,
    pub persist_workers: usize,
    pub download_queue: usize,
    pub analyze_queue: usize,
    pub persist_queue: usize,
    /// Bounded wait of `submit` on a full download queue
    pub submit_timeout_ms: u64,
    pub download_timeout_secs: u64,
    /// Downloads larger than this fail; unlimited when unset
    pub max_download_bytes: Option<u64>,
    /// Move the raw file to `quarantine/` when persisting its result fails
    pub quarantine_on_persist_failure: bool,
    pub retry: RetrySettings,
}

/// Download retry strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetrySettings {
    SingleAttempt,
    ExponentialBackoff {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        #[serde(default = "default_base_delay_ms")]
        base_delay_ms: u64,
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
    },
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Pause above this CPU usage (percent)
    pub cpu_threshold: f64,
    /// Pause above this RAM usage (percent)
    pub ram_threshold: f64,
    /// Minimum time paused before resuming
    pub resume_cooldown_secs: u64,
    pub check_interval_secs: u64,
    /// Process names (from `/proc/*/comm`) that force a pause while running
    pub heavy_processes: Vec<String>,
    /// Discovery runs only while the download queue holds fewer items
    pub discovery_low_watermark: usize,
    /// Minimum time between two discovery rounds
    pub discovery_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// External classifier; files are recorded `UNCLASSIFIED` when unset
    pub command: Option<PathBuf>,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

/// One `[[sources]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Plugin identifier in the registry
    pub id: String,
    /// Display name; the plugin's own name when unset
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Index pages (index_scraper) or artifact URLs (seed_list)
    #[serde(default)]
    pub urls: Vec<String>,
    /// File extensions the scraper collects
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Fixed kind; inferred from the extension when unset
    #[serde(default)]
    pub kind: Option<ArtifactKind>,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            enabled: true,
            urls: Vec::new(),
            extensions: Vec::new(),
            kind: None,
            object_name: None,
            dataset: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            download_workers: 10,
            analyze_workers: 5,
            persist_workers: 2,
            download_queue: 100,
            analyze_queue: 50,
            persist_queue: 50,
            submit_timeout_ms: 5000,
            download_timeout_secs: 300,
            max_download_bytes: None,
            quarantine_on_persist_failure: true,
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings::SingleAttempt
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            cpu_threshold: 85.0,
            ram_threshold: 90.0,
            resume_cooldown_secs: 60,
            check_interval_secs: 10,
            heavy_processes: Vec::new(),
            discovery_low_watermark: 10,
            discovery_interval_secs: 300,
        }
    }
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: 600,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            logging: LoggingSettings::default(),
            pipeline: PipelineSettings::default(),
            daemon: DaemonSettings::default(),
            analyzer: AnalyzerSettings::default(),
            sources: vec![
                SourceConfig::new("breakthrough_listen"),
                SourceConfig::new("vlass_quicklook"),
            ],
        }
    }
}

impl PipelineSettings {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl DaemonSettings {
    pub fn resume_cooldown(&self) -> Duration {
        Duration::from_secs(self.resume_cooldown_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}

impl IngestConfig {
    /// Load from the located TOML file (defaults when none exists), apply
    /// environment overrides and validate
    pub fn load(explicit: Option<&Path>) -> IngestResult<Self> {
        let mut config = match locate_config_file(explicit) {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                load_toml_config::<IngestConfig>(&path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                IngestConfig::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment beats TOML for the analyzer command
    pub fn apply_env_overrides(&mut self) {
        if let Ok(command) = std::env::var(ANALYZER_ENV_VAR) {
            if command.trim().is_empty() {
                return;
            }
            if self.analyzer.command.is_some() {
                warn!(
                    "Analyzer command set in both {} and TOML. Using environment.",
                    ANALYZER_ENV_VAR
                );
            }
            self.analyzer.command = Some(PathBuf::from(command));
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> IngestResult<()> {
        let p = &self.pipeline;
        for (name, value) in [
            ("pipeline.download_workers", p.download_workers),
            ("pipeline.analyze_workers", p.analyze_workers),
            ("pipeline.persist_workers", p.persist_workers),
            ("pipeline.download_queue", p.download_queue),
            ("pipeline.analyze_queue", p.analyze_queue),
            ("pipeline.persist_queue", p.persist_queue),
        ] {
            if value == 0 {
                return Err(IngestError::Config(format!("{} must be at least 1", name)));
            }
        }

        if let RetrySettings::ExponentialBackoff {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        } = p.retry
        {
            if max_attempts == 0 {
                return Err(IngestError::Config(
                    "pipeline.retry.max_attempts must be at least 1".to_string(),
                ));
            }
            if base_delay_ms > max_delay_ms {
                return Err(IngestError::Config(
                    "pipeline.retry.base_delay_ms exceeds max_delay_ms".to_string(),
                ));
            }
        }

        let d = &self.daemon;
        for (name, value) in [
            ("daemon.cpu_threshold", d.cpu_threshold),
            ("daemon.ram_threshold", d.ram_threshold),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(IngestError::Config(format!(
                    "{} must be in (0, 100], got {}",
                    name, value
                )));
            }
        }
        if d.check_interval_secs == 0 {
            return Err(IngestError::Config(
                "daemon.check_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.analyzer.timeout_secs == 0 {
            return Err(IngestError::Config(
                "analyzer.timeout_secs must be at least 1".to_string(),
            ));
        }

        if let Some(source) = self.sources.iter().find(|s| s.id.trim().is_empty()) {
            return Err(IngestError::Config(format!(
                "source entry {:?} has an empty id",
                source.name
            )));
        }

        Ok(())
    }

    /// JSON copy recorded with each run session
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
