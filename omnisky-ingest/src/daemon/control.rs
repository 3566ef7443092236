//! Resource-aware admission control
//!
//! `DaemonControl` decides every cycle whether the daemon may feed the
//! pipeline. Pressure (a heavy process, CPU or RAM above threshold) pauses
//! immediately; resuming waits until `resume_cooldown` has passed since the
//! pause began, so a load that hovers around a threshold does not flap the
//! daemon on and off.

use super::resource_monitor::{ResourceProbe, ResourceSample};
use crate::config::DaemonSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub const REASON_SYSTEM_OK: &str = "SYSTEM_OK";
pub const REASON_COOLDOWN: &str = "COOLDOWN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DaemonState {
    #[default]
    Running,
    Paused,
    /// Running, nothing queued
    Idle,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Running => "RUNNING",
            DaemonState::Paused => "PAUSED",
            DaemonState::Idle => "IDLE",
        }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time source for the cooldown
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Outcome of one control cycle
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonDecision {
    pub state: DaemonState,
    pub reason: String,
    pub metrics: ResourceSample,
}

impl DaemonDecision {
    /// Whether new work may be admitted
    pub fn admits_work(&self) -> bool {
        self.state != DaemonState::Paused
    }
}

pub struct DaemonControl {
    probe: Arc<dyn ResourceProbe>,
    clock: Arc<dyn Clock>,
    cpu_threshold: f64,
    ram_threshold: f64,
    heavy_processes: Vec<String>,
    resume_cooldown: Duration,
    paused_since: Option<Instant>,
    operator_reason: Option<String>,
}

impl DaemonControl {
    pub fn new(settings: &DaemonSettings, probe: Arc<dyn ResourceProbe>, clock: Arc<dyn Clock>) -> Self {
        Self {
            probe,
            clock,
            cpu_threshold: settings.cpu_threshold,
            ram_threshold: settings.ram_threshold,
            heavy_processes: settings
                .heavy_processes
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            resume_cooldown: settings.resume_cooldown(),
            paused_since: None,
            operator_reason: None,
        }
    }

    /// Force `PAUSED` while `Some`; the operator's reason is reported
    pub fn set_operator_pause(&mut self, reason: Option<String>) {
        if self.operator_reason != reason {
            match &reason {
                Some(r) => info!(reason = %r, "Operator paused the daemon"),
                None => info!("Operator resumed the daemon"),
            }
        }
        self.operator_reason = reason;
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some() || self.operator_reason.is_some()
    }

    /// Current pressure reason, if any, with the sample it was judged on
    async fn evaluate(&self) -> (ResourceSample, Option<String>) {
        let sample = self.probe.sample().await;

        if !self.heavy_processes.is_empty() {
            let running = self.probe.running_process_names().await;
            if let Some(name) = running
                .iter()
                .find(|name| self.heavy_processes.contains(&name.to_lowercase()))
            {
                return (sample, Some(format!("HEAVY_PROCESS: {}", name)));
            }
        }

        if sample.cpu_pct > self.cpu_threshold {
            return (sample, Some(format!("CPU_HIGH: {:.1}%", sample.cpu_pct)));
        }
        if sample.ram_pct > self.ram_threshold {
            return (sample, Some(format!("RAM_HIGH: {:.1}%", sample.ram_pct)));
        }

        (sample, None)
    }

    /// Whether the host is under pressure right now, ignoring hysteresis
    pub async fn check_should_pause(&self) -> (bool, String) {
        match self.evaluate().await {
            (_, Some(reason)) => (true, reason),
            (_, None) => (false, REASON_SYSTEM_OK.to_string()),
        }
    }

    /// Run one control cycle
    ///
    /// `pipeline_busy` distinguishes `RUNNING` from `IDLE`.
    pub async fn tick(&mut self, pipeline_busy: bool) -> DaemonDecision {
        let (metrics, pressure) = self.evaluate().await;
        let now = self.clock.now();

        let (state, reason) = match pressure {
            Some(reason) => {
                if self.paused_since.is_none() {
                    info!(reason = %reason, "Pausing daemon");
                    self.paused_since = Some(now);
                }
                (DaemonState::Paused, reason)
            }
            None => match self.paused_since {
                Some(since) if now.duration_since(since) < self.resume_cooldown => {
                    (DaemonState::Paused, REASON_COOLDOWN.to_string())
                }
                Some(_) => {
                    info!("Resuming daemon: system free");
                    self.paused_since = None;
                    (DaemonState::Running, REASON_SYSTEM_OK.to_string())
                }
                None => (DaemonState::Running, REASON_SYSTEM_OK.to_string()),
            },
        };

        let (state, reason) = match &self.operator_reason {
            Some(r) => (DaemonState::Paused, format!("OPERATOR: {}", r)),
            None if state == DaemonState::Running && !pipeline_busy => (DaemonState::Idle, reason),
            None => (state, reason),
        };

        DaemonDecision {
            state,
            reason,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeProbe {
        sample: Mutex<ResourceSample>,
        processes: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sample: Mutex::new(ResourceSample::default()),
                processes: Mutex::new(Vec::new()),
            })
        }

        fn set_cpu(&self, cpu_pct: f64) {
            self.sample.lock().unwrap().cpu_pct = cpu_pct;
        }
    }

    #[async_trait]
    impl ResourceProbe for FakeProbe {
        async fn sample(&self) -> ResourceSample {
            *self.sample.lock().unwrap()
        }
        async fn running_process_names(&self) -> Vec<String> {
            self.processes.lock().unwrap().clone()
        }
    }

    fn settings() -> DaemonSettings {
        DaemonSettings {
            cpu_threshold: 85.0,
            ram_threshold: 90.0,
            resume_cooldown_secs: 60,
            heavy_processes: vec!["Blender".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_check_should_pause_reasons() {
        let probe = FakeProbe::new();
        let control = DaemonControl::new(&settings(), probe.clone(), Arc::new(SystemClock));

        assert_eq!(control.check_should_pause().await, (false, "SYSTEM_OK".to_string()));

        probe.set_cpu(93.27);
        assert_eq!(control.check_should_pause().await, (true, "CPU_HIGH: 93.3%".to_string()));

        probe.set_cpu(10.0);
        probe.sample.lock().unwrap().ram_pct = 95.0;
        assert_eq!(control.check_should_pause().await, (true, "RAM_HIGH: 95.0%".to_string()));

        probe.processes.lock().unwrap().push("blender".to_string());
        assert_eq!(
            control.check_should_pause().await,
            (true, "HEAVY_PROCESS: blender".to_string())
        );
    }

    #[tokio::test]
    async fn test_cooldown_hysteresis() {
        let probe = FakeProbe::new();
        let clock = Arc::new(ManualClock::new());
        let mut control = DaemonControl::new(&settings(), probe.clone(), clock.clone());

        probe.set_cpu(95.0);
        let decision = control.tick(true).await;
        assert_eq!(decision.state, DaemonState::Paused);
        assert!(decision.reason.starts_with("CPU_HIGH"));

        probe.set_cpu(20.0);
        clock.advance(Duration::from_secs(30));
        let decision = control.tick(true).await;
        assert_eq!(decision.state, DaemonState::Paused);
        assert_eq!(decision.reason, REASON_COOLDOWN);
        assert!(!decision.admits_work());

        clock.advance(Duration::from_secs(31));
        let decision = control.tick(true).await;
        assert_eq!(decision.state, DaemonState::Running);
        assert_eq!(decision.reason, REASON_SYSTEM_OK);
    }

    #[tokio::test]
    async fn test_idle_and_operator_pause() {
        let probe = FakeProbe::new();
        let mut control = DaemonControl::new(&settings(), probe, Arc::new(ManualClock::new()));

        assert_eq!(control.tick(false).await.state, DaemonState::Idle);
        assert_eq!(control.tick(true).await.state, DaemonState::Running);

        control.set_operator_pause(Some("disk swap".to_string()));
        let decision = control.tick(false).await;
        assert_eq!(decision.state, DaemonState::Paused);
        assert_eq!(decision.reason, "OPERATOR: disk swap");

        control.set_operator_pause(None);
        assert!(control.tick(true).await.admits_work());
    }
}
