use crate::cancel::CancelToken;
use crate::result::TestStatus;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::info;

/// Campaign counters. Written by the fuzzing loop, read by anyone.
#[derive(Debug)]
pub struct FuzzStats {
    started: Instant,
    iterations: AtomicU64,
    executions: AtomicU64,
    passed: AtomicU64,
    failed: AtomicU64,
    errored: AtomicU64,
    cancelled: AtomicU64,
    skipped_rounds: AtomicU64,
    bugs: AtomicU64,
    trims: AtomicU64,
    pool_size: AtomicU64,
}

impl Default for FuzzStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            iterations: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            skipped_rounds: AtomicU64::new(0),
            bugs: AtomicU64::new(0),
            trims: AtomicU64::new(0),
            pool_size: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub elapsed_secs: f64,
    pub iterations: u64,
    pub executions: u64,
    pub passed: u64,
    pub failed: u64,
    pub errored: u64,
    pub cancelled: u64,
    pub skipped_rounds: u64,
    pub bugs: u64,
    pub trims: u64,
    pub pool_size: u64,
}

impl StatsSnapshot {
    pub fn execs_per_sec(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.executions as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

impl FuzzStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one execution of the target under its final classification.
    pub fn record_execution(&self, status: TestStatus) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            TestStatus::Pass => &self.passed,
            TestStatus::Fail => &self.failed,
            TestStatus::Error => &self.errored,
            TestStatus::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A round that ended before anything was executed.
    pub fn record_skipped_round(&self) {
        self.skipped_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bug(&self) {
        self.bugs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trim(&self) {
        self.trims.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_pool_size(&self, size: usize) {
        self.pool_size.store(size as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            iterations: self.iterations.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            skipped_rounds: self.skipped_rounds.load(Ordering::Relaxed),
            bugs: self.bugs.load(Ordering::Relaxed),
            trims: self.trims.load(Ordering::Relaxed),
            pool_size: self.pool_size.load(Ordering::Relaxed),
        }
    }
}

/// Logs a progress line every `interval` until `stop` is cancelled.
pub fn spawn_reporter(stats: Arc<FuzzStats>, interval: Duration, stop: CancelToken) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.sleep(interval) {
            let snapshot = stats.snapshot();
            info!(
                iterations = snapshot.iterations,
                executions = snapshot.executions,
                pool = snapshot.pool_size,
                bugs = snapshot.bugs,
                failed = snapshot.failed,
                errored = snapshot.errored,
                execs_per_sec = %format!("{:.2}", snapshot.execs_per_sec()),
                "Fuzzing progress"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_follow_recorded_events() {
        let stats = FuzzStats::new();
        stats.record_iteration();
        stats.record_iteration();
        stats.record_execution(TestStatus::Pass);
        stats.record_execution(TestStatus::Fail);
        stats.record_execution(TestStatus::Fail);
        stats.record_execution(TestStatus::Cancelled);
        stats.record_skipped_round();
        stats.record_bug();
        stats.record_trim();
        stats.set_pool_size(4);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.iterations, 2);
        assert_eq!(snapshot.executions, 4);
        assert_eq!((snapshot.passed, snapshot.failed, snapshot.errored), (1, 2, 0));
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.skipped_rounds, 1);
        assert_eq!((snapshot.bugs, snapshot.trims, snapshot.pool_size), (1, 1, 4));
    }

    #[test]
    fn reporter_stops_when_cancelled() {
        let stats = Arc::new(FuzzStats::new());
        let stop = CancelToken::new();
        let handle = spawn_reporter(Arc::clone(&stats), Duration::from_millis(20), stop.clone());
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        stop.cancel();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
