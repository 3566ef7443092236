//! Stage logic run by the pipeline workers
//!
//! Each function handles one item and always ends it in one of two ways:
//! handed to the next stage's queue, or finished at a terminal status with
//! its temporary file removed (or quarantined). Errors never escape a task.

use super::retry::RetryPolicy;
use super::{PipelineCounters, QueuedUrls, StageSender};
use crate::db::ArtifactStore;
use crate::error::IngestError;
use crate::models::{ArtifactStatus, ClassificationResult, DownloadOutcome, NewEvent, Registration, Target};
use crate::observability::{Observability, Stage, StatusUpdate};
use crate::services::{AnalyzeError, Analyzer, Cleanup, DownloadError, DownloadedFile, Downloader};
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const EVENT_DOWNLOAD_FAILED: &str = "ARTIFACT_DOWNLOAD_FAILED";
pub const EVENT_DUPLICATE: &str = "ARTIFACT_DUPLICATE";
pub const EVENT_ANALYSIS_FAILED: &str = "ARTIFACT_ANALYSIS_FAILED";
pub const EVENT_CLEANED: &str = "ARTIFACT_CLEANED";
pub const EVENT_PERSIST_FAILED: &str = "ARTIFACT_PERSIST_FAILED";

/// Downloaded artifact waiting for analysis
#[derive(Debug)]
pub(crate) struct AnalyzeJob {
    pub artifact_id: i64,
    pub target: Target,
    pub file: DownloadedFile,
}

/// Classified artifact waiting to be persisted
#[derive(Debug)]
pub(crate) struct PersistJob {
    pub artifact_id: i64,
    pub target: Target,
    pub path: PathBuf,
    pub result: ClassificationResult,
}

/// Collaborators shared by every worker
pub(crate) struct StageContext {
    pub store: ArtifactStore,
    pub downloader: Arc<dyn Downloader>,
    pub analyzer: Arc<dyn Analyzer>,
    pub cleanup: Arc<dyn Cleanup>,
    pub observability: Arc<Observability>,
    pub temp_dir: PathBuf,
    pub retry: RetryPolicy,
    pub quarantine_on_persist_failure: bool,
    pub counters: Arc<PipelineCounters>,
    pub queued: QueuedUrls,
}

impl StageContext {
    async fn report(&self, stage: Stage, artifact_id: Option<i64>, url: &str) {
        self.observability
            .update(
                StatusUpdate::stage(stage)
                    .with_queues(self.counters.depths())
                    .with_current(artifact_id, Some(url.to_string())),
            )
            .await;
    }

    /// Item reached a terminal outcome
    async fn finish(&self) {
        if self.counters.finish() == 0 {
            self.observability
                .update(
                    StatusUpdate::stage(Stage::Idle)
                        .with_queues(self.counters.depths())
                        .with_current(None, None),
                )
                .await;
        }
    }
}

/// Text of a panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Downloader call with a panic turned into `DownloadError::Panicked`
async fn fetch_guarded(ctx: &StageContext, target: &Target, dest: &Path) -> Result<DownloadedFile, DownloadError> {
    match AssertUnwindSafe(ctx.downloader.fetch(target, dest)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(url = %target.url, panic = %message, "Downloader panicked");
            Err(DownloadError::Panicked(message))
        }
    }
}

/// Analyzer call with a panic turned into `AnalyzeError::Panicked`
async fn analyze_guarded(
    ctx: &StageContext,
    target: &Target,
    path: &Path,
) -> Result<ClassificationResult, AnalyzeError> {
    match AssertUnwindSafe(ctx.analyzer.analyze(target.kind, path)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(url = %target.url, panic = %message, "Analyzer panicked");
            Err(AnalyzeError::Panicked(message))
        }
    }
}

pub(crate) async fn download(ctx: &StageContext, target: Target, analyze_tx: &StageSender<AnalyzeJob>) {
    ctx.report(Stage::Download, None, &target.url).await;

    if let Some(job) = download_inner(ctx, target).await {
        let artifact_id = job.artifact_id;
        if let Err(job) = analyze_tx.send(job).await {
            // Queue closed under us; the row stays DOWNLOADED for startup recovery
            error!(artifact_id, "Analyze queue closed, dropping downloaded artifact");
            ctx.cleanup.remove(&job.file.path).await;
            ctx.finish().await;
        }
        return;
    }

    ctx.finish().await;
}

async fn download_inner(ctx: &StageContext, target: Target) -> Option<AnalyzeJob> {
    let registration = ctx.store.register(&target).await;
    ctx.queued.remove(&target.url);
    let artifact_id = match registration {
        Ok(Registration::Known { id, status }) => {
            debug!(artifact_id = id, status = %status, url = %target.url, "URL already registered, skipping");
            return None;
        }
        Ok(registration) => registration.claimed_id()?,
        Err(e) => {
            error!(url = %target.url, error = %e, "Failed to register artifact");
            return None;
        }
    };

    if let Err(e) = ctx
        .store
        .transition(artifact_id, ArtifactStatus::New, ArtifactStatus::Downloading)
        .await
    {
        warn!(artifact_id, error = %e, "Could not start download");
        return None;
    }

    ctx.report(Stage::Download, Some(artifact_id), &target.url).await;

    let dest = ctx.temp_dir.join(target.temp_file_name());
    let fetched = ctx
        .retry
        .run(
            "download",
            || fetch_guarded(ctx, &target, &dest),
            |e: &DownloadError| e.is_transient(),
        )
        .await;

    let file = match fetched {
        Ok(file) => file,
        Err(e) => {
            let reason = if e.is_transient() {
                IngestError::TransientIo(e.to_string()).to_string()
            } else {
                e.to_string()
            };
            warn!(artifact_id, url = %target.url, error = %reason, "Download failed");
            ctx.cleanup.remove(&dest).await;
            mark(ctx, artifact_id, ArtifactStatus::Downloading, ArtifactStatus::Failed, &reason).await;
            ctx.observability
                .log_event(
                    EVENT_DOWNLOAD_FAILED,
                    json!({ "artifact_id": artifact_id, "url": target.url, "error": reason }),
                )
                .await;
            return None;
        }
    };

    match ctx.store.record_download(artifact_id, &file).await {
        Ok(DownloadOutcome::Unique) => {
            info!(
                artifact_id,
                size_bytes = file.size_bytes,
                hash = %file.content_hash,
                "Downloaded"
            );
            Some(AnalyzeJob {
                artifact_id,
                target,
                file,
            })
        }
        Ok(DownloadOutcome::Duplicate { original_id }) => {
            info!(artifact_id, ?original_id, hash = %file.content_hash, "Duplicate content");
            ctx.cleanup.remove(&file.path).await;
            ctx.observability
                .log_event(
                    EVENT_DUPLICATE,
                    json!({
                        "artifact_id": artifact_id,
                        "original_id": original_id,
                        "url": target.url,
                        "hash": file.content_hash,
                    }),
                )
                .await;
            None
        }
        Err(e) => {
            error!(artifact_id, error = %e, "Failed to record download");
            ctx.cleanup.remove(&file.path).await;
            mark(
                ctx,
                artifact_id,
                ArtifactStatus::Downloading,
                ArtifactStatus::Failed,
                &e.to_string(),
            )
            .await;
            None
        }
    }
}

pub(crate) async fn analyze(ctx: &StageContext, job: AnalyzeJob, persist_tx: &StageSender<PersistJob>) {
    let AnalyzeJob {
        artifact_id,
        target,
        file,
    } = job;
    ctx.report(Stage::Analyze, Some(artifact_id), &target.url).await;

    if let Err(e) = ctx
        .store
        .transition(artifact_id, ArtifactStatus::Downloaded, ArtifactStatus::Analyzing)
        .await
    {
        warn!(artifact_id, error = %e, "Could not start analysis");
        ctx.cleanup.remove(&file.path).await;
        ctx.finish().await;
        return;
    }

    let outcome = match analyze_guarded(ctx, &target, &file.path).await {
        Ok(result) if result.is_empty() => Err(AnalyzeError::EmptyResult),
        other => other,
    };

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            let reason = IngestError::AnalysisFailure(e.to_string()).to_string();
            warn!(artifact_id, error = %reason, "Analysis failed");
            ctx.cleanup.remove(&file.path).await;
            mark(ctx, artifact_id, ArtifactStatus::Analyzing, ArtifactStatus::FailedAnalysis, &reason).await;
            ctx.observability
                .log_event(
                    EVENT_ANALYSIS_FAILED,
                    json!({ "artifact_id": artifact_id, "url": target.url, "error": reason }),
                )
                .await;
            ctx.finish().await;
            return;
        }
    };

    debug!(artifact_id, label = %result.label, score = result.score, "Analyzed");

    let job = PersistJob {
        artifact_id,
        target,
        path: file.path,
        result,
    };
    if let Err(job) = persist_tx.send(job).await {
        error!(artifact_id, "Persist queue closed, abandoning analyzed artifact");
        ctx.cleanup.remove(&job.path).await;
        mark(
            ctx,
            artifact_id,
            ArtifactStatus::Analyzing,
            ArtifactStatus::ErrorAnalyzing,
            "persist queue closed",
        )
        .await;
        ctx.finish().await;
    }
}

pub(crate) async fn persist(ctx: &StageContext, job: PersistJob) {
    let PersistJob {
        artifact_id,
        target,
        path,
        result,
    } = job;
    ctx.report(Stage::Persist, Some(artifact_id), &target.url).await;

    let event = NewEvent::from_classification(artifact_id, &target, &result);

    match ctx.store.persist_event(&event).await {
        Ok(persisted) => {
            ctx.cleanup.remove(&path).await;
            info!(
                artifact_id,
                event_id = persisted.event_id,
                family_id = %persisted.family_id,
                label = %event.label,
                "Artifact cleaned"
            );
            ctx.observability
                .log_event(
                    EVENT_CLEANED,
                    json!({
                        "artifact_id": artifact_id,
                        "event_id": persisted.event_id,
                        "family_id": persisted.family_id,
                        "new_family": persisted.new_family,
                        "label": event.label,
                        "score": event.score,
                    }),
                )
                .await;
        }
        Err(e) => {
            let reason = IngestError::PersistFailure(e.to_string()).to_string();
            error!(artifact_id, error = %reason, "Persist failed");
            mark(ctx, artifact_id, ArtifactStatus::Analyzing, ArtifactStatus::ErrorAnalyzing, &reason).await;

            let quarantined = if ctx.quarantine_on_persist_failure {
                match ctx.cleanup.quarantine(&path).await {
                    Ok(moved) => {
                        warn!(artifact_id, path = %moved.display(), "Raw file quarantined");
                        Some(moved)
                    }
                    Err(qe) => {
                        warn!(artifact_id, error = %qe, "Quarantine failed, deleting raw file");
                        ctx.cleanup.remove(&path).await;
                        None
                    }
                }
            } else {
                ctx.cleanup.remove(&path).await;
                None
            };

            ctx.observability
                .log_event(
                    EVENT_PERSIST_FAILED,
                    json!({
                        "artifact_id": artifact_id,
                        "error": reason,
                        "quarantined": quarantined.map(|p| p.display().to_string()),
                    }),
                )
                .await;
        }
    }

    ctx.finish().await;
}

/// Record a failure status; a row that already moved on is only logged
async fn mark(ctx: &StageContext, artifact_id: i64, from: ArtifactStatus, to: ArtifactStatus, reason: &str) {
    if let Err(e) = ctx.store.mark_failed(artifact_id, from, to, reason).await {
        error!(artifact_id, from = %from, to = %to, error = %e, "Failed to record failure status");
    }
}
