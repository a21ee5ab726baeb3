//! Resource monitoring of a running target.
//!
//! A [`ResourceMonitor`] samples CPU usage, resident memory and the size of the
//! target's log file on a fixed interval. It runs on its own thread for the
//! lifetime of one execution and reports the first sustained threshold breach
//! over a channel to the executor, which owns the process handle and decides
//! how to terminate.

use crate::cancel::CancelToken;
use crate::result::ExceptionType;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// One reading of the target's resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Reads resource usage of a process tree.
pub trait ResourceSampler: Send {
    /// Returns `None` once the root process no longer exists.
    fn sample(&mut self, pid: u32) -> Option<ResourceSample>;
}

/// Production sampler backed by `sysinfo`, summing the target and every
/// descendant process.
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self, pid: u32) -> Option<ResourceSample> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        let root = Pid::from_u32(pid);
        self.system.process(root)?;

        let processes = self.system.processes();
        let mut tree: HashSet<Pid> = HashSet::from([root]);
        loop {
            let before = tree.len();
            for (child, process) in processes {
                if let Some(parent) = process.parent() {
                    if tree.contains(&parent) {
                        tree.insert(*child);
                    }
                }
            }
            if tree.len() == before {
                break;
            }
        }

        let mut sample = ResourceSample::default();
        for pid in &tree {
            if let Some(process) = processes.get(pid) {
                sample.cpu_percent += process.cpu_usage();
                sample.memory_bytes += process.memory();
            }
        }
        Some(sample)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// CPU usage in percent of one core; values above 100 span several cores.
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub log_growth_mb: Option<u64>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Samples in a row a metric must stay above its threshold.
    #[serde(default = "default_consecutive_samples")]
    pub consecutive_samples: u32,
}

fn default_interval_ms() -> u64 {
    500
}

fn default_consecutive_samples() -> u32 {
    1
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            cpu_percent: None,
            memory_mb: None,
            log_growth_mb: None,
            log_file: None,
            consecutive_samples: default_consecutive_samples(),
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            cpu_percent: self.cpu_percent,
            memory_bytes: self.memory_mb.map(|mb| mb * 1024 * 1024),
            log_growth_bytes: self.log_growth_mb.map(|mb| mb * 1024 * 1024),
            consecutive_samples: self.consecutive_samples.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
    pub log_growth_bytes: Option<u64>,
    pub consecutive_samples: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        MonitorSettings::default().thresholds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    Cpu,
    Memory,
    LogGrowth,
}

impl From<Breach> for ExceptionType {
    fn from(breach: Breach) -> Self {
        match breach {
            Breach::Cpu => ExceptionType::Cpu,
            Breach::Memory => ExceptionType::Memory,
            Breach::LogGrowth => ExceptionType::LogGrowth,
        }
    }
}

/// Message sent from the monitor thread to the executor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorEvent {
    Breach(Breach),
    TargetGone,
}

/// Latest readings plus peaks, returned when the monitor stops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    pub elapsed: Duration,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub log_size: u64,
    pub peak_cpu_percent: f32,
    pub peak_memory_bytes: u64,
    pub log_growth_bytes: u64,
    pub samples: u64,
    pub breach: Option<Breach>,
}

#[derive(Debug, Default)]
struct Streaks {
    cpu: u32,
    memory: u32,
    log: u32,
}

impl Streaks {
    fn bump(counter: &mut u32, over: bool) -> u32 {
        *counter = if over { *counter + 1 } else { 0 };
        *counter
    }
}

pub struct ResourceMonitor<S: ResourceSampler> {
    sampler: S,
    thresholds: Thresholds,
    interval: Duration,
    log_file: Option<PathBuf>,
}

impl<S: ResourceSampler> ResourceMonitor<S> {
    pub fn new(sampler: S, thresholds: Thresholds, interval: Duration) -> Self {
        Self {
            sampler,
            thresholds,
            interval,
            log_file: None,
        }
    }

    pub fn with_log_file(mut self, log_file: Option<PathBuf>) -> Self {
        self.log_file = log_file;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn log_size(&self) -> u64 {
        self.log_file
            .as_ref()
            .and_then(|path| std::fs::metadata(path).ok())
            .map(|meta| meta.len())
            .unwrap_or(0)
    }

    /// Samples `pid` until `stop` or `cancel` is set, the target disappears or
    /// a breach is detected. A breach or disappearance is also sent on
    /// `events`.
    pub fn run(
        &mut self,
        pid: u32,
        stop: &CancelToken,
        cancel: &CancelToken,
        events: Sender<MonitorEvent>,
    ) -> MonitorReport {
        let start = Instant::now();
        let log_baseline = self.log_size();
        let mut report = MonitorReport {
            log_size: log_baseline,
            ..Default::default()
        };
        let mut streaks = Streaks::default();
        let needed = self.thresholds.consecutive_samples.max(1);

        while !stop.is_cancelled() && !cancel.is_cancelled() {
            let Some(sample) = self.sampler.sample(pid) else {
                debug!(pid, "Target no longer present, monitor stopping");
                let _ = events.send(MonitorEvent::TargetGone);
                break;
            };
            report.samples += 1;
            report.elapsed = start.elapsed();
            report.cpu_percent = sample.cpu_percent;
            report.memory_bytes = sample.memory_bytes;
            report.peak_cpu_percent = report.peak_cpu_percent.max(sample.cpu_percent);
            report.peak_memory_bytes = report.peak_memory_bytes.max(sample.memory_bytes);
            report.log_size = self.log_size();
            report.log_growth_bytes = report.log_size.saturating_sub(log_baseline);

            let cpu_over = self
                .thresholds
                .cpu_percent
                .is_some_and(|limit| sample.cpu_percent > limit);
            let memory_over = self
                .thresholds
                .memory_bytes
                .is_some_and(|limit| sample.memory_bytes > limit);
            let log_over = self
                .thresholds
                .log_growth_bytes
                .is_some_and(|limit| report.log_growth_bytes > limit);

            let breach = if Streaks::bump(&mut streaks.memory, memory_over) >= needed {
                Some(Breach::Memory)
            } else if Streaks::bump(&mut streaks.cpu, cpu_over) >= needed {
                Some(Breach::Cpu)
            } else if Streaks::bump(&mut streaks.log, log_over) >= needed {
                Some(Breach::LogGrowth)
            } else {
                None
            };

            if let Some(breach) = breach {
                warn!(
                    pid,
                    ?breach,
                    cpu = sample.cpu_percent,
                    memory = sample.memory_bytes,
                    log_growth = report.log_growth_bytes,
                    "Resource threshold exceeded"
                );
                report.breach = Some(breach);
                let _ = events.send(MonitorEvent::Breach(breach));
                break;
            }

            if stop.sleep(self.interval) {
                break;
            }
        }
        report.elapsed = start.elapsed();
        report
    }
}
