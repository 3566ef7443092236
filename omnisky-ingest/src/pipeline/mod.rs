//! Three-stage ingestion pipeline
//!
//! ```text
//! submit ──► [download queue] ──► download workers ──► [analyze queue]
//!        ──► analyze workers ──► [persist queue] ──► persist workers
//! ```
//!
//! Every queue is a bounded channel drained by one dispatcher task. The
//! dispatcher acquires a worker permit *before* pulling an item, so a
//! saturated pool leaves items queued and a full queue blocks the upstream
//! stage: backpressure reaches `submit`, which gives up after a bounded wait.
//!
//! Shutdown cascades through channel closure. Cancelling stops the download
//! dispatcher (queued, unregistered targets are dropped); once the last
//! download worker finishes the analyze channel closes, its dispatcher drains
//! what is left and exits, and the persist stage follows the same way. No
//! downloaded file is abandoned mid-pipeline.

pub mod retry;
mod tasks;

pub use retry::RetryPolicy;
pub use tasks::{
    EVENT_ANALYSIS_FAILED, EVENT_CLEANED, EVENT_DOWNLOAD_FAILED, EVENT_DUPLICATE,
    EVENT_PERSIST_FAILED,
};

use crate::config::PipelineSettings;
use crate::db::ArtifactStore;
use crate::models::Target;
use crate::observability::{Observability, QueueDepths, Stage};
use crate::services::{Analyzer, Cleanup, Downloader};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasks::{AnalyzeJob, PersistJob, StageContext};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Collaborators the pipeline drives
pub struct PipelineServices {
    pub store: ArtifactStore,
    pub downloader: Arc<dyn Downloader>,
    pub analyzer: Arc<dyn Analyzer>,
    pub cleanup: Arc<dyn Cleanup>,
    pub observability: Arc<Observability>,
}

/// URLs accepted by `submit` whose artifact row is not registered yet
///
/// Queued targets are invisible to the store until a download worker picks
/// them up; discovery checks this set too so a slow queue is not refilled
/// with the same URLs.
#[derive(Debug, Clone, Default)]
pub struct QueuedUrls(Arc<std::sync::Mutex<HashMap<String, usize>>>);

impl QueuedUrls {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub(crate) fn insert(&self, url: &str) {
        *self.entries().entry(url.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn remove(&self, url: &str) {
        let mut entries = self.entries();
        if let Some(count) = entries.get_mut(url) {
            *count -= 1;
            if *count == 0 {
                entries.remove(url);
            }
        }
    }

    fn clear(&self) {
        self.entries().clear();
    }
}

/// Queue gauges and the count of accepted, unfinished items
pub(crate) struct PipelineCounters {
    download: Arc<AtomicUsize>,
    analyze: Arc<AtomicUsize>,
    persist: Arc<AtomicUsize>,
    active: AtomicUsize,
    pending: watch::Sender<usize>,
}

impl PipelineCounters {
    fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            download: Arc::new(AtomicUsize::new(0)),
            analyze: Arc::new(AtomicUsize::new(0)),
            persist: Arc::new(AtomicUsize::new(0)),
            active: AtomicUsize::new(0),
            pending,
        }
    }

    pub(crate) fn depths(&self) -> QueueDepths {
        QueueDepths {
            download: self.download.load(Ordering::SeqCst),
            analyze: self.analyze.load(Ordering::SeqCst),
            persist: self.persist.load(Ordering::SeqCst),
        }
    }

    fn accept(&self) {
        self.pending.send_modify(|n| *n += 1);
    }

    /// Returns the number of items still pending
    pub(crate) fn finish(&self) -> usize {
        let mut remaining = 0;
        self.pending.send_modify(|n| {
            *n = n.saturating_sub(1);
            remaining = *n;
        });
        remaining
    }

    fn pending(&self) -> usize {
        *self.pending.borrow()
    }
}

/// Sending half of a stage queue; keeps the depth gauge in step
pub(crate) struct StageSender<T> {
    tx: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for StageSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<T> StageSender<T> {
    /// Wait for room; returns the item if the queue is closed
    pub(crate) async fn send(&self, item: T) -> Result<(), T> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(item).await.map_err(|e| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }

    async fn send_timeout(&self, item: T, timeout: Duration) -> Result<(), mpsc::error::SendTimeoutError<T>> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send_timeout(item, timeout).await.map_err(|e| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            e
        })
    }
}

fn stage_queue<T>(capacity: usize, depth: Arc<AtomicUsize>) -> (StageSender<T>, mpsc::Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (StageSender { tx, depth }, rx)
}

/// Pulls items off one queue into a bounded worker pool
struct Dispatcher<T> {
    stage: Stage,
    rx: mpsc::Receiver<T>,
    depth: Arc<AtomicUsize>,
    workers: Arc<Semaphore>,
    paused: watch::Receiver<bool>,
    cancel: Option<CancellationToken>,
    tracker: TaskTracker,
    counters: Arc<PipelineCounters>,
}

/// Tracks one item held by a worker task
///
/// The stage body settles `pending` itself. If the task unwinds before the
/// body returns, the guard settles it so `wait_idle` and `has_work` stay true
/// to what is actually left.
struct WorkerGuard {
    stage: Stage,
    counters: Arc<PipelineCounters>,
    completed: bool,
}

impl WorkerGuard {
    fn new(stage: Stage, counters: Arc<PipelineCounters>) -> Self {
        counters.active.fetch_add(1, Ordering::SeqCst);
        Self {
            stage,
            counters,
            completed: false,
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        if !self.completed {
            warn!(stage = ?self.stage, "Worker ended without finishing its item");
            self.counters.finish();
        }
    }
}

async fn cancelled(token: &Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl<T: Send + 'static> Dispatcher<T> {
    async fn run<F, Fut>(mut self, handler: F)
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!(stage = ?self.stage, "Dispatcher started");

        // Sender gone means the manager is gone; ignore pauses and keep draining
        let mut pause_live = true;

        'dispatch: loop {
            while pause_live && *self.paused.borrow() {
                tokio::select! {
                    biased;
                    _ = cancelled(&self.cancel) => break 'dispatch,
                    changed = self.paused.changed() => {
                        if changed.is_err() {
                            pause_live = false;
                        }
                    }
                }
            }

            let permit = tokio::select! {
                biased;
                _ = cancelled(&self.cancel) => break 'dispatch,
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break 'dispatch,
                },
            };

            // A pause that lands while waiting for an item takes effect before the item is pulled
            let item = tokio::select! {
                biased;
                _ = cancelled(&self.cancel) => break 'dispatch,
                changed = self.paused.changed(), if pause_live => {
                    if changed.is_err() {
                        pause_live = false;
                    }
                    continue 'dispatch;
                }
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break 'dispatch,
                },
            };
            self.depth.fetch_sub(1, Ordering::SeqCst);

            let work = handler(item);
            let mut guard = WorkerGuard::new(self.stage, self.counters.clone());
            self.tracker.spawn(async move {
                work.await;
                guard.completed = true;
                drop(permit);
            });
        }

        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            self.rx.close();
            let mut dropped = 0usize;
            while self.rx.try_recv().is_ok() {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                self.counters.finish();
                dropped += 1;
            }
            if dropped > 0 {
                info!(stage = ?self.stage, dropped, "Dropped queued items on shutdown");
            }
        }

        debug!(stage = ?self.stage, "Dispatcher stopped");
    }
}

/// Owner of the three stage queues and their worker pools
pub struct PipelineManager {
    download_tx: StageSender<Target>,
    submit_timeout: Duration,
    counters: Arc<PipelineCounters>,
    queued: QueuedUrls,
    paused_tx: watch::Sender<bool>,
    accepting: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineManager {
    /// Create the queues and spawn the dispatchers
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(settings: &PipelineSettings, temp_dir: PathBuf, services: PipelineServices) -> Self {
        let counters = Arc::new(PipelineCounters::new());
        let queued = QueuedUrls::default();
        let (paused_tx, _) = watch::channel(false);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let (download_tx, download_rx) = stage_queue::<Target>(settings.download_queue, counters.download.clone());
        let (analyze_tx, analyze_rx) = stage_queue::<AnalyzeJob>(settings.analyze_queue, counters.analyze.clone());
        let (persist_tx, persist_rx) = stage_queue::<PersistJob>(settings.persist_queue, counters.persist.clone());

        let ctx = Arc::new(StageContext {
            store: services.store,
            downloader: services.downloader,
            analyzer: services.analyzer,
            cleanup: services.cleanup,
            observability: services.observability,
            temp_dir,
            retry: RetryPolicy::from(&settings.retry),
            quarantine_on_persist_failure: settings.quarantine_on_persist_failure,
            counters: counters.clone(),
            queued: queued.clone(),
        });

        let download = {
            let d = Dispatcher {
                stage: Stage::Download,
                rx: download_rx,
                depth: counters.download.clone(),
                workers: Arc::new(Semaphore::new(settings.download_workers)),
                paused: paused_tx.subscribe(),
                cancel: Some(cancel.clone()),
                tracker: tracker.clone(),
                counters: counters.clone(),
            };
            let ctx = ctx.clone();
            tokio::spawn(d.run(move |target| {
                let ctx = ctx.clone();
                let analyze_tx = analyze_tx.clone();
                async move { tasks::download(&ctx, target, &analyze_tx).await }
            }))
        };

        let analyze = {
            let d = Dispatcher {
                stage: Stage::Analyze,
                rx: analyze_rx,
                depth: counters.analyze.clone(),
                workers: Arc::new(Semaphore::new(settings.analyze_workers)),
                paused: paused_tx.subscribe(),
                cancel: None,
                tracker: tracker.clone(),
                counters: counters.clone(),
            };
            let ctx = ctx.clone();
            tokio::spawn(d.run(move |job| {
                let ctx = ctx.clone();
                let persist_tx = persist_tx.clone();
                async move { tasks::analyze(&ctx, job, &persist_tx).await }
            }))
        };

        let persist = {
            let d = Dispatcher {
                stage: Stage::Persist,
                rx: persist_rx,
                depth: counters.persist.clone(),
                workers: Arc::new(Semaphore::new(settings.persist_workers)),
                paused: paused_tx.subscribe(),
                cancel: None,
                tracker: tracker.clone(),
                counters: counters.clone(),
            };
            tokio::spawn(d.run(move |job| {
                let ctx = ctx.clone();
                async move { tasks::persist(&ctx, job).await }
            }))
        };

        info!(
            download_workers = settings.download_workers,
            analyze_workers = settings.analyze_workers,
            persist_workers = settings.persist_workers,
            "Pipeline started"
        );

        Self {
            download_tx,
            submit_timeout: settings.submit_timeout(),
            counters,
            queued,
            paused_tx,
            accepting: AtomicBool::new(true),
            cancel,
            tracker,
            dispatchers: Mutex::new(vec![download, analyze, persist]),
        }
    }

    /// Enqueue `target` for download
    ///
    /// Waits at most the submit timeout for room. `false` means the queue
    /// stayed full or the pipeline is shutting down; callers should slow
    /// discovery.
    pub async fn submit(&self, target: Target) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            return false;
        }

        self.counters.accept();
        self.queued.insert(&target.url);
        match self.download_tx.send_timeout(target, self.submit_timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(target)) => {
                self.queued.remove(&target.url);
                self.counters.finish();
                debug!(url = %target.url, "Download queue full, submit timed out");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(target)) => {
                self.queued.remove(&target.url);
                self.counters.finish();
                debug!(url = %target.url, "Download queue closed");
                false
            }
        }
    }

    /// Shared view of the URLs waiting in the download queue
    pub fn queued_urls(&self) -> QueuedUrls {
        self.queued.clone()
    }

    pub fn queue_depths(&self) -> QueueDepths {
        self.counters.depths()
    }

    /// Items currently held by a worker, all stages
    pub fn in_flight(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Accepted items not yet at a terminal outcome
    pub fn pending(&self) -> usize {
        self.counters.pending()
    }

    pub fn has_work(&self) -> bool {
        self.pending() > 0
    }

    /// Wait until every accepted item is finished; `false` on timeout
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.counters.pending.subscribe();
        let idle = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await;
        matches!(idle, Ok(Ok(_)))
    }

    /// Stop (or resume) pulling items off every queue
    ///
    /// Items already handed to a worker run to completion.
    pub fn set_dispatch_paused(&self, paused: bool) {
        let previous = self.paused_tx.send_replace(paused);
        if previous != paused {
            info!(paused, "Pipeline dispatch {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn is_dispatch_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// Stop accepting work, drain downloaded items and wait for every worker
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(pending = self.pending(), "Pipeline shutting down");

        self.paused_tx.send_replace(false);
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.dispatchers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatcher task failed");
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.queued.clear();
        info!("Pipeline stopped");
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_worker_guard_settles_item_on_panic() {
        let counters = Arc::new(PipelineCounters::new());
        counters.accept();
        counters.accept();

        let mut clean = WorkerGuard::new(Stage::Persist, counters.clone());
        let handle = tokio::spawn(async move {
            clean.completed = true;
        });
        handle.await.unwrap();
        assert_eq!(counters.pending(), 2, "a finished body settles its own item");

        let guard = WorkerGuard::new(Stage::Analyze, counters.clone());
        assert_eq!(counters.active.load(Ordering::SeqCst), 1);
        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("stage body blew up");
        });
        assert!(handle.await.unwrap_err().is_panic());

        assert_eq!(counters.active.load(Ordering::SeqCst), 0);
        assert_eq!(counters.pending(), 1);
    }

    #[test]
    fn test_queued_urls_count_repeated_submits() {
        let queued = QueuedUrls::default();
        queued.insert("http://a/1.h5");
        queued.insert("http://a/1.h5");
        queued.insert("http://a/2.h5");
        assert_eq!(queued.len(), 2);

        queued.remove("http://a/1.h5");
        assert!(queued.contains("http://a/1.h5"), "second copy is still queued");
        queued.remove("http://a/1.h5");
        assert!(!queued.contains("http://a/1.h5"));

        queued.remove("http://a/never.h5");
        queued.clear();
        assert!(queued.is_empty());
    }
}
