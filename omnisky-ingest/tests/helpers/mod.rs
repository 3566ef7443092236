//! Test Helper Utilities
//!
//! In-memory collaborators and a scratch root for pipeline and daemon tests

#![allow(dead_code)]

use async_trait::async_trait;
use omnisky_common::config::RootLayout;
use omnisky_ingest::config::PipelineSettings;
use omnisky_ingest::db::ArtifactStore;
use omnisky_ingest::models::{ArtifactKind, ClassificationResult, Target};
use omnisky_ingest::observability::Observability;
use omnisky_ingest::pipeline::{PipelineManager, PipelineServices};
use omnisky_ingest::services::{
    content_hash, AnalyzeError, Analyzer, DownloadError, DownloadedFile, Downloader, FsCleanup,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Serves bytes per URL from memory
#[derive(Default)]
pub struct FakeDownloader {
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// URL → remaining 503 answers before the bytes are served
    transient_failures: Mutex<HashMap<String, u32>>,
    /// URLs whose fetch panics after writing part of the file
    panics: Mutex<Vec<String>>,
    delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, url: &str, bytes: &[u8]) -> Self {
        self.add_file(url, bytes);
        self
    }

    pub fn with_transient_failures(self, url: &str, times: u32) -> Self {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    pub fn with_panic(self, url: &str) -> Self {
        self.panics.lock().unwrap().push(url.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn add_file(&self, url: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), bytes.to_vec());
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch(&self, target: &Target, dest: &Path) -> Result<DownloadedFile, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let should_panic = self.panics.lock().unwrap().iter().any(|u| u == &target.url);
        if should_panic {
            tokio::fs::write(dest, b"partial").await?;
            panic!("fake downloader crashed on {}", target.url);
        }

        {
            let mut failures = self.transient_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&target.url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DownloadError::HttpStatus {
                        status: 503,
                        url: target.url.clone(),
                    });
                }
            }
        }

        let bytes = self.files.lock().unwrap().get(&target.url).cloned();
        let Some(bytes) = bytes else {
            return Err(DownloadError::HttpStatus {
                status: 404,
                url: target.url.clone(),
            });
        };

        tokio::fs::write(dest, &bytes).await?;
        Ok(DownloadedFile {
            path: dest.to_path_buf(),
            content_hash: content_hash(&bytes),
            size_bytes: bytes.len() as u64,
        })
    }
}

#[derive(Debug, Clone)]
pub enum AnalyzerMode {
    Classify { label: String, score: f64 },
    Fail,
    Empty,
    Panic,
}

/// Scripted analyzer; insists the file exists when called
pub struct FakeAnalyzer {
    mode: AnalyzerMode,
    pub calls: AtomicUsize,
}

impl FakeAnalyzer {
    pub fn classify(label: &str, score: f64) -> Self {
        Self {
            mode: AnalyzerMode::Classify {
                label: label.to_string(),
                score,
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            mode: AnalyzerMode::Fail,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self {
            mode: AnalyzerMode::Empty,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn panicking() -> Self {
        Self {
            mode: AnalyzerMode::Panic,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze(
        &self,
        _kind: ArtifactKind,
        path: &Path,
    ) -> Result<ClassificationResult, AnalyzeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !path.exists() {
            return Err(AnalyzeError::InvalidOutput(format!(
                "{} missing at analysis time",
                path.display()
            )));
        }

        match &self.mode {
            AnalyzerMode::Classify { label, score } => {
                let mut result = ClassificationResult::new(label.clone(), *score);
                result.metrics.insert("snr".to_string(), json!(25.0));
                Ok(result)
            }
            AnalyzerMode::Fail => Err(AnalyzeError::Failed {
                code: Some(2),
                stderr: "model crashed".to_string(),
            }),
            AnalyzerMode::Empty => Ok(ClassificationResult::new("", 0.0)),
            AnalyzerMode::Panic => panic!("fake analyzer crashed on {}", path.display()),
        }
    }
}

/// Scratch root with a migrated store and observability files
pub struct TestEnv {
    pub dir: TempDir,
    pub layout: RootLayout,
    pub store: ArtifactStore,
    pub observability: Arc<Observability>,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let layout = RootLayout::new(dir.path().join("root"));
        layout.ensure_directories().unwrap();

        let store = ArtifactStore::open(&layout.database_path()).await.unwrap();
        let observability = Arc::new(Observability::new(&layout.obs_dir()));

        Self {
            dir,
            layout,
            store,
            observability,
        }
    }

    pub fn start_pipeline(
        &self,
        settings: &PipelineSettings,
        downloader: Arc<dyn Downloader>,
        analyzer: Arc<dyn Analyzer>,
    ) -> PipelineManager {
        PipelineManager::start(
            settings,
            self.layout.temp_dir(),
            PipelineServices {
                store: self.store.clone(),
                downloader,
                analyzer,
                cleanup: Arc::new(FsCleanup::new(self.layout.quarantine_dir())),
                observability: self.observability.clone(),
            },
        )
    }

    pub fn temp_files(&self) -> Vec<PathBuf> {
        dir_entries(&self.layout.temp_dir())
    }

    pub fn quarantined_files(&self) -> Vec<PathBuf> {
        dir_entries(&self.layout.quarantine_dir())
    }
}

fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

/// Small pools and short timeouts
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        download_workers: 2,
        analyze_workers: 2,
        persist_workers: 1,
        download_queue: 8,
        analyze_queue: 4,
        persist_queue: 4,
        submit_timeout_ms: 200,
        ..Default::default()
    }
}

pub fn radio_target(url: &str) -> Target {
    Target::new(url, ArtifactKind::Radio)
        .with_object_name("VOYAGER-1")
        .with_metadata("frequency", 8419.29)
        .with_metadata("drift", 0.0)
}

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
