//! Status snapshot and event log
//!
//! `Observability` is created once per process and shared by `Arc`. It owns
//! two files below the observability directory:
//!
//! - `status.json`: latest pipeline status, rewritten atomically (temp file +
//!   rename) on every update so readers never see a torn file
//! - `event_log.jsonl`: one JSON object per line, append-only, tailable
//!
//! Each file has its own lock. Write failures are logged and never propagate
//! into the pipeline.

use crate::daemon::DaemonState;
use crate::error::IngestResult;
use omnisky_common::time::now_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

/// Capacity of the in-process event broadcast
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Block size for the backwards scan of the event log
const TAIL_BLOCK_BYTES: u64 = 8 * 1024;

/// Pipeline stage last reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    #[default]
    Idle,
    Discovery,
    Download,
    Analyze,
    Persist,
}

/// Items waiting in each stage queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub download: usize,
    pub analyze: usize,
    pub persist: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.download + self.analyze + self.persist
    }
}

/// Artifact most recently picked up by a stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentItem {
    pub artifact_id: Option<i64>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu: f64,
    pub ram: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub reason: String,
}

/// Contents of `status.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub stage: Stage,
    pub queues: QueueDepths,
    pub current: CurrentItem,
    pub metrics: ResourceMetrics,
    pub daemon: DaemonStatus,
    pub updated_at: String,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self {
            stage: Stage::Idle,
            queues: QueueDepths::default(),
            current: CurrentItem::default(),
            metrics: ResourceMetrics::default(),
            daemon: DaemonStatus::default(),
            updated_at: now_rfc3339(),
        }
    }
}

/// Partial status change; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub stage: Option<Stage>,
    pub queues: Option<QueueDepths>,
    pub current: Option<CurrentItem>,
    pub metrics: Option<ResourceMetrics>,
    pub daemon: Option<DaemonStatus>,
}

impl StatusUpdate {
    pub fn stage(stage: Stage) -> Self {
        Self {
            stage: Some(stage),
            ..Default::default()
        }
    }

    pub fn with_queues(mut self, queues: QueueDepths) -> Self {
        self.queues = Some(queues);
        self
    }

    pub fn with_current(mut self, artifact_id: Option<i64>, url: Option<String>) -> Self {
        self.current = Some(CurrentItem { artifact_id, url });
        self
    }

    pub fn with_metrics(mut self, cpu: f64, ram: f64) -> Self {
        self.metrics = Some(ResourceMetrics { cpu, ram });
        self
    }

    pub fn with_daemon(mut self, state: DaemonState, reason: impl Into<String>) -> Self {
        self.daemon = Some(DaemonStatus {
            state,
            reason: reason.into(),
        });
        self
    }

    fn apply_to(self, status: &mut PipelineStatus) {
        if let Some(stage) = self.stage {
            status.stage = stage;
        }
        if let Some(queues) = self.queues {
            status.queues = queues;
        }
        if let Some(current) = self.current {
            status.current = current;
        }
        if let Some(metrics) = self.metrics {
            status.metrics = metrics;
        }
        if let Some(daemon) = self.daemon {
            status.daemon = daemon;
        }
    }
}

/// One line of `event_log.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub ts: String,
    pub event: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Status snapshot, event log and event broadcast of one process
pub struct Observability {
    status_path: PathBuf,
    log_path: PathBuf,
    status: Mutex<PipelineStatus>,
    log_lock: Mutex<()>,
    events_tx: broadcast::Sender<LoggedEvent>,
}

impl Observability {
    /// Observability writing `status.json` and `event_log.jsonl` in `obs_dir`
    pub fn new(obs_dir: &Path) -> Self {
        Self::with_paths(obs_dir.join("status.json"), obs_dir.join("event_log.jsonl"))
    }

    pub fn with_paths(status_path: PathBuf, log_path: PathBuf) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            status_path,
            log_path,
            status: Mutex::new(PipelineStatus::default()),
            log_lock: Mutex::new(()),
            events_tx,
        }
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Merge `update` into the snapshot and rewrite `status.json`
    pub async fn update(&self, update: StatusUpdate) {
        let mut status = self.status.lock().await;
        update.apply_to(&mut status);
        status.updated_at = now_rfc3339();

        if let Err(e) = write_status_file(&self.status_path, &status).await {
            tracing::warn!(path = %self.status_path.display(), error = %e, "Failed to write status file");
        }
    }

    pub async fn snapshot(&self) -> PipelineStatus {
        self.status.lock().await.clone()
    }

    /// Append `{ts, event, ...fields}` to the event log and broadcast it
    ///
    /// `fields` should be a JSON object; any other value is stored under
    /// `"value"`.
    pub async fn log_event(&self, event_type: &str, fields: Value) {
        let fields = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let record = LoggedEvent {
            ts: now_rfc3339(),
            event: event_type.to_string(),
            fields,
        };

        {
            let _guard = self.log_lock.lock().await;
            if let Err(e) = append_record(&self.log_path, &record).await {
                tracing::warn!(path = %self.log_path.display(), error = %e, "Failed to append event log");
            }
        }

        // No subscribers is not an error
        let _ = self.events_tx.send(record);
    }

    /// Last `n` logged events, newest first
    pub async fn recent_events(&self, n: usize) -> IngestResult<Vec<LoggedEvent>> {
        let _guard = self.log_lock.lock().await;
        read_recent_events(&self.log_path, n).await
    }

    /// Events logged from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LoggedEvent> {
        self.events_tx.subscribe()
    }
}

async fn write_status_file(path: &Path, status: &PipelineStatus) -> IngestResult<()> {
    let json = serde_json::to_vec_pretty(status).map_err(|e| {
        omnisky_common::Error::Internal(format!("Failed to serialize status: {}", e))
    })?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn append_record(path: &Path, record: &LoggedEvent) -> IngestResult<()> {
    let mut line = serde_json::to_string(record).map_err(|e| {
        omnisky_common::Error::Internal(format!("Failed to serialize event: {}", e))
    })?;
    line.push('\n');

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    // One write per record keeps concurrent tailers from seeing half a line
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Read the status file written by a (possibly other) process
pub async fn read_status_file(path: &Path) -> IngestResult<Option<PipelineStatus>> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let status = serde_json::from_slice(&content).map_err(|e| {
        omnisky_common::Error::InvalidInput(format!("Malformed {}: {}", path.display(), e))
    })?;
    Ok(Some(status))
}

/// Last `n` records of the event log at `path`, newest first
///
/// Scans backwards from the end of the file in fixed blocks, parsing lines as
/// they complete, and stops once `n` records are collected; older parts of
/// the file are never read. Malformed lines are skipped and do not count.
pub async fn read_recent_events(path: &Path, n: usize) -> IngestResult<Vec<LoggedEvent>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let path = path.to_path_buf();
    let events = tokio::task::spawn_blocking(move || tail_events(&path, n))
        .await
        .map_err(|e| omnisky_common::Error::Internal(format!("Event log reader panicked: {}", e)))??;
    Ok(events)
}

fn tail_events(path: &Path, n: usize) -> std::io::Result<Vec<LoggedEvent>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut pos = file.metadata()?.len();
    // Bytes before the earliest newline seen so far; possibly a cut line
    let mut partial: Vec<u8> = Vec::new();
    let mut events = Vec::with_capacity(n.min(1024));

    while pos > 0 && events.len() < n {
        let block = TAIL_BLOCK_BYTES.min(pos);
        pos -= block;

        let mut chunk = vec![0u8; block as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&partial);

        if pos == 0 {
            partial.clear();
            push_newest(&chunk, n, &mut events);
            break;
        }

        match chunk.iter().position(|&b| b == b'\n') {
            Some(first_newline) => {
                push_newest(&chunk[first_newline + 1..], n, &mut events);
                chunk.truncate(first_newline);
                partial = chunk;
            }
            None => partial = chunk,
        }
    }

    Ok(events)
}

/// Parse whole lines in `bytes` from last to first until `events` holds `n`
fn push_newest(bytes: &[u8], n: usize, events: &mut Vec<LoggedEvent>) {
    for raw in bytes.split(|&b| b == b'\n').rev() {
        if events.len() >= n {
            return;
        }
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LoggedEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => tracing::debug!(error = %e, "Skipping malformed event log line"),
        }
    }
}
