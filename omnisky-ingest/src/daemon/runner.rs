//! Daemon main loop
//!
//! Every `check_interval`:
//! 1. read the operator control file
//! 2. tick `DaemonControl` (resource pressure, cooldown, operator pause)
//! 3. publish daemon state and queue depths to the status snapshot and a
//!    telemetry row
//! 4. when work is admitted and the download queue is below its low
//!    watermark, run a discovery round and submit the new targets

use super::control::{DaemonControl, DaemonDecision, DaemonState};
use super::control_file::ControlFile;
use crate::config::DaemonSettings;
use crate::db::{ArtifactStore, RecoveryReport, TelemetrySample};
use crate::discovery::DiscoveryAgent;
use crate::error::IngestResult;
use crate::observability::{Observability, Stage, StatusUpdate};
use crate::pipeline::PipelineManager;
use omnisky_common::time::now_rfc3339;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const EVENT_DAEMON_STATE: &str = "DAEMON_STATE_CHANGED";
pub const EVENT_DISCOVERY_ROUND: &str = "DISCOVERY_ROUND";
pub const EVENT_SESSION_STARTED: &str = "SESSION_STARTED";
pub const EVENT_SESSION_ENDED: &str = "SESSION_ENDED";

/// Settle what a previous process left behind; call before the pipeline starts
///
/// Closes sessions never ended, moves interrupted artifacts to terminal or
/// reclaimable states and empties the temp directory (nothing is in flight
/// yet, so every file there is an orphan).
pub async fn recover_previous_run(store: &ArtifactStore, temp_dir: &Path) -> IngestResult<RecoveryReport> {
    let stale = store.close_stale_sessions().await?;
    if stale > 0 {
        warn!(sessions = stale, "Closed sessions left open by a previous run");
    }

    let report = store.recover_interrupted().await?;

    let mut removed = 0usize;
    if let Ok(mut entries) = tokio::fs::read_dir(temp_dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_file() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove orphaned temp file"),
                }
            }
        }
    }
    if removed > 0 {
        info!(removed, "Removed orphaned temp files");
    }

    Ok(report)
}

pub struct DaemonRunner {
    store: ArtifactStore,
    pipeline: Arc<PipelineManager>,
    discovery: DiscoveryAgent,
    control: DaemonControl,
    observability: Arc<Observability>,
    control_path: PathBuf,
    settings: DaemonSettings,
    session_id: Option<Uuid>,
    last_state: Option<DaemonState>,
    last_discovery: Option<Instant>,
}

impl DaemonRunner {
    pub fn new(
        store: ArtifactStore,
        pipeline: Arc<PipelineManager>,
        discovery: DiscoveryAgent,
        control: DaemonControl,
        observability: Arc<Observability>,
        control_path: PathBuf,
        settings: DaemonSettings,
    ) -> Self {
        Self {
            store,
            pipeline,
            discovery,
            control,
            observability,
            control_path,
            settings,
            session_id: None,
            last_state: None,
            last_discovery: None,
        }
    }

    /// Attach telemetry rows to a run session
    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Cycle until `shutdown` fires, then drain the pipeline and end the session
    pub async fn run(mut self, shutdown: CancellationToken) -> IngestResult<()> {
        if let Some(id) = self.session_id {
            self.observability
                .log_event(EVENT_SESSION_STARTED, json!({ "session_id": id.to_string() }))
                .await;
        }

        info!(
            interval_secs = self.settings.check_interval_secs,
            plugins = self.discovery.plugin_count(),
            "Daemon loop started"
        );

        loop {
            self.cycle().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.check_interval()) => {}
            }
        }

        info!("Shutdown requested, draining pipeline");
        self.pipeline.shutdown().await;

        if let Some(id) = self.session_id {
            self.store.end_session(id).await?;
            self.observability
                .log_event(EVENT_SESSION_ENDED, json!({ "session_id": id.to_string() }))
                .await;
        }

        self.observability
            .update(
                StatusUpdate::stage(Stage::Idle)
                    .with_queues(self.pipeline.queue_depths())
                    .with_current(None, None)
                    .with_daemon(DaemonState::Paused, "SHUTDOWN"),
            )
            .await;

        info!("Daemon stopped");
        Ok(())
    }

    /// One control cycle
    pub async fn cycle(&mut self) -> DaemonDecision {
        let operator = ControlFile::read(&self.control_path).await;
        self.control
            .set_operator_pause(operator.is_paused().then(|| operator.reason.clone()));
        self.pipeline
            .set_dispatch_paused(operator.is_paused() && !operator.finish_current_job);

        let decision = self.control.tick(self.pipeline.has_work()).await;
        self.publish(&decision).await;

        if decision.admits_work() {
            self.maybe_discover().await;
        }

        decision
    }

    async fn publish(&mut self, decision: &DaemonDecision) {
        let depths = self.pipeline.queue_depths();

        if self.last_state != Some(decision.state) {
            info!(state = %decision.state, reason = %decision.reason, "Daemon state changed");
            self.observability
                .log_event(
                    EVENT_DAEMON_STATE,
                    json!({
                        "from": self.last_state.map(|s| s.as_str()),
                        "to": decision.state.as_str(),
                        "reason": decision.reason,
                    }),
                )
                .await;
            self.last_state = Some(decision.state);
        }

        self.observability
            .update(
                StatusUpdate::default()
                    .with_queues(depths)
                    .with_metrics(decision.metrics.cpu_pct, decision.metrics.ram_pct)
                    .with_daemon(decision.state, decision.reason.clone()),
            )
            .await;

        let sample = TelemetrySample {
            timestamp: now_rfc3339(),
            session_id: self.session_id.map(|id| id.to_string()),
            cpu_pct: decision.metrics.cpu_pct,
            ram_pct: decision.metrics.ram_pct,
            q_download: depths.download as i64,
            q_analyze: depths.analyze as i64,
            q_persist: depths.persist as i64,
            in_flight: self.pipeline.in_flight() as i64,
            daemon_state: decision.state.as_str().to_string(),
        };
        if let Err(e) = self.store.record_telemetry(&sample).await {
            warn!(error = %e, "Failed to record telemetry");
        }
    }

    async fn maybe_discover(&mut self) {
        let depths = self.pipeline.queue_depths();
        if depths.download >= self.settings.discovery_low_watermark {
            debug!(queued = depths.download, "Download queue above low watermark, skipping discovery");
            return;
        }
        if let Some(last) = self.last_discovery {
            if last.elapsed() < self.settings.discovery_interval() {
                return;
            }
        }
        self.last_discovery = Some(Instant::now());

        self.observability.update(StatusUpdate::stage(Stage::Discovery)).await;

        let targets = match self.discovery.find_new_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "Discovery round failed");
                return;
            }
        };

        let found = targets.len();
        let mut submitted = 0usize;
        for target in targets {
            if !self.pipeline.submit(target).await {
                // Unsubmitted targets stay unregistered and are found again next round
                info!(submitted, remaining = found - submitted, "Pipeline backpressure, deferring targets");
                break;
            }
            submitted += 1;
        }

        self.observability
            .log_event(
                EVENT_DISCOVERY_ROUND,
                json!({ "found": found, "submitted": submitted }),
            )
            .await;
    }
}
