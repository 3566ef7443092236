//! Host load sampling
//!
//! Linux: CPU from two `/proc/stat` samples, RAM from `/proc/meminfo`
//! (`MemTotal` / `MemAvailable`), processes from `/proc/<pid>/comm`. Where
//! those files cannot be read (other platforms, restricted containers) the
//! probe reports zero load and no processes.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

/// Gap between the two `/proc/stat` reads
pub const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_pct: f64,
    pub ram_pct: f64,
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> ResourceSample;

    /// Names of running processes, as the kernel reports them
    async fn running_process_names(&self) -> Vec<String>;
}

/// Aggregate CPU jiffies from the `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

/// Parse the aggregate `cpu` line; idle includes iowait, guest time is
/// already counted in user/nice
pub fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse().unwrap_or(0))
        .collect();
    if fields.len() < 4 {
        return None;
    }

    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Busy share between two samples, percent
pub fn cpu_percent(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let busy = after.busy.saturating_sub(before.busy);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

fn parse_meminfo_value(s: &str) -> u64 {
    s.trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .unwrap_or(0)
}

/// Used RAM percent from `/proc/meminfo`
pub fn parse_ram_percent(meminfo: &str) -> Option<f64> {
    let mut total_kb = 0u64;
    let mut available_kb = None;

    for line in meminfo.lines() {
        if let Some(val) = line.strip_prefix("MemTotal:") {
            total_kb = parse_meminfo_value(val);
        } else if let Some(val) = line.strip_prefix("MemAvailable:") {
            available_kb = Some(parse_meminfo_value(val));
        }
    }

    if total_kb == 0 {
        return None;
    }
    let used = total_kb.saturating_sub(available_kb?);
    Some(used as f64 / total_kb as f64 * 100.0)
}

/// `/proc` filesystem probe
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    proc_root: PathBuf,
    cpu_window: Duration,
}

impl ProcfsProbe {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Probe reading an alternative procfs mount
    pub fn with_root(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            cpu_window: CPU_SAMPLE_WINDOW,
        }
    }

    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window;
        self
    }

    async fn read_cpu_times(&self) -> Option<CpuTimes> {
        let stat = tokio::fs::read_to_string(self.proc_root.join("stat")).await.ok()?;
        parse_cpu_times(&stat)
    }

    async fn cpu_pct(&self) -> f64 {
        let Some(before) = self.read_cpu_times().await else {
            return 0.0;
        };
        tokio::time::sleep(self.cpu_window).await;
        let Some(after) = self.read_cpu_times().await else {
            return 0.0;
        };
        cpu_percent(before, after)
    }

    async fn ram_pct(&self) -> f64 {
        match tokio::fs::read_to_string(self.proc_root.join("meminfo")).await {
            Ok(meminfo) => parse_ram_percent(&meminfo).unwrap_or(0.0),
            Err(_) => 0.0,
        }
    }
}

impl Default for ProcfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for ProcfsProbe {
    async fn sample(&self) -> ResourceSample {
        ResourceSample {
            cpu_pct: self.cpu_pct().await,
            ram_pct: self.ram_pct().await,
        }
    }

    async fn running_process_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.proc_root).await else {
            return names;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_pid = entry
                .file_name()
                .to_str()
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }
            // Processes exit between listing and reading; skip those
            if let Ok(comm) = tokio::fs::read_to_string(entry.path().join("comm")).await {
                let name = comm.trim();
                if !name.is_empty() {
                    names.push(name.to_string());
                }
            }
        }

        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STAT_BEFORE: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const STAT_AFTER: &str = "cpu  250 0 150 800 100 0 0 0 0 0\n";

    #[test]
    fn test_parse_cpu_times() {
        let times = parse_cpu_times(STAT_BEFORE).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.busy, 200);
        assert!(parse_cpu_times("intr 1 2 3").is_none());
    }

    #[test]
    fn test_cpu_percent_between_samples() {
        let before = parse_cpu_times(STAT_BEFORE).unwrap();
        let after = parse_cpu_times(STAT_AFTER).unwrap();
        // 300 jiffies elapsed, 200 of them busy
        let pct = cpu_percent(before, after);
        assert!((pct - 66.666).abs() < 0.01, "got {}", pct);
        assert_eq!(cpu_percent(after, after), 0.0);
    }

    #[test]
    fn test_parse_ram_percent() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        assert_eq!(parse_ram_percent(meminfo), Some(75.0));
        assert_eq!(parse_ram_percent("MemTotal: 0 kB\n"), None);
        assert_eq!(parse_ram_percent("MemTotal: 100 kB\n"), None);
    }

    #[tokio::test]
    async fn test_probe_reads_fake_procfs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stat"), STAT_BEFORE).unwrap();
        std::fs::write(
            dir.path().join("meminfo"),
            "MemTotal: 1000 kB\nMemAvailable: 900 kB\n",
        )
        .unwrap();
        for (pid, comm) in [("1", "systemd\n"), ("4242", "blender\n")] {
            std::fs::create_dir(dir.path().join(pid)).unwrap();
            std::fs::write(dir.path().join(pid).join("comm"), comm).unwrap();
        }
        std::fs::create_dir(dir.path().join("self")).unwrap();

        let probe = ProcfsProbe::with_root(dir.path()).with_cpu_window(Duration::from_millis(1));
        let sample = probe.sample().await;
        assert_eq!(sample.cpu_pct, 0.0);
        assert!((sample.ram_pct - 10.0).abs() < 1e-9);

        let mut names = probe.running_process_names().await;
        names.sort();
        assert_eq!(names, vec!["blender", "systemd"]);
    }

    #[tokio::test]
    async fn test_missing_procfs_reports_zero() {
        let probe = ProcfsProbe::with_root("/nonexistent/proc").with_cpu_window(Duration::from_millis(1));
        assert_eq!(probe.sample().await, ResourceSample::default());
        assert!(probe.running_process_names().await.is_empty());
    }
}
