use crate::cancel::CancelToken;
use crate::config::ExecutorSettings;
use crate::input::Testcase;
use crate::monitor::{Breach, MonitorEvent, MonitorReport, ResourceMonitor, ResourceSampler};
use crate::process::{self, CONFIG_PLACEHOLDER};
use crate::regression::RegressionPhase;
use crate::render::ConfigRenderer;
use crate::result::{Artifacts, ExceptionType, TestResult, TestStatus};
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Runs one testcase against the target and classifies the outcome.
pub trait Executor {
    fn run_test(&mut self, testcase: &mut Testcase, cancel: &CancelToken) -> TestResult;

    /// Absolute point in time after which runs are cancelled.
    fn set_deadline(&mut self, deadline: Option<Instant>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    Launching,
    Running,
    Passed,
    Failed(ExceptionType),
    Errored,
    Cancelled,
}

#[derive(Debug)]
enum Verdict {
    Exited(ExitStatus),
    Breach(Breach),
    TimedOut,
    Cancelled,
    WaitFailed(String),
}

#[derive(Debug, Clone, Copy)]
struct Budgets {
    timeout: Duration,
    poll: Duration,
    deadline: Option<Instant>,
}

impl Budgets {
    fn campaign_over(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Deploys a testcase, launches the target under a resource monitor and waits
/// for exit, breach, timeout or cancellation.
pub struct SystemTestExecutor<S: ResourceSampler> {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
    poll_interval: Duration,
    kill_grace: Duration,
    config_path: PathBuf,
    renderer: ConfigRenderer,
    monitor: ResourceMonitor<S>,
    regression: Option<RegressionPhase>,
    deadline: Option<Instant>,
    state: ExecState,
}

impl<S: ResourceSampler> SystemTestExecutor<S> {
    pub fn new(
        settings: &ExecutorSettings,
        renderer: ConfigRenderer,
        monitor: ResourceMonitor<S>,
    ) -> Self {
        Self {
            command: settings.command.clone(),
            working_dir: settings.working_dir.clone(),
            timeout: Duration::from_millis(settings.timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms.max(1)),
            kill_grace: Duration::from_millis(settings.kill_grace_ms),
            config_path: settings.config_path.clone(),
            renderer,
            monitor,
            regression: None,
            deadline: None,
            state: ExecState::Idle,
        }
    }

    pub fn with_regression(mut self, regression: Option<RegressionPhase>) -> Self {
        self.regression = regression;
        self
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    fn transition(&mut self, next: ExecState) {
        debug!(from = ?self.state, to = ?next, "Executor state change");
        self.state = next;
    }

    fn finish(&mut self, result: TestResult) -> TestResult {
        let terminal = match result.status {
            TestStatus::Pass => ExecState::Passed,
            TestStatus::Fail => ExecState::Failed(result.exception),
            TestStatus::Error => ExecState::Errored,
            TestStatus::Cancelled => ExecState::Cancelled,
        };
        self.transition(terminal);
        result
    }

    fn supervise(
        child: &mut Child,
        events: &Receiver<MonitorEvent>,
        cancel: &CancelToken,
        budgets: Budgets,
    ) -> Verdict {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Verdict::Exited(status),
                Ok(None) => {}
                Err(e) => return Verdict::WaitFailed(format!("Error waiting for target: {e}")),
            }
            match events.try_recv() {
                Ok(MonitorEvent::Breach(breach)) => return Verdict::Breach(breach),
                Ok(MonitorEvent::TargetGone) | Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {}
            }
            if cancel.is_cancelled() || budgets.campaign_over() {
                return Verdict::Cancelled;
            }
            if start.elapsed() > budgets.timeout {
                return Verdict::TimedOut;
            }
            std::thread::sleep(budgets.poll);
        }
    }
}

impl<S: ResourceSampler> Executor for SystemTestExecutor<S> {
    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    fn run_test(&mut self, testcase: &mut Testcase, cancel: &CancelToken) -> TestResult {
        self.transition(ExecState::Launching);
        let mut artifacts = Artifacts::default();
        let budgets = Budgets {
            timeout: self.timeout,
            poll: self.poll_interval,
            deadline: self.deadline,
        };
        if cancel.is_cancelled() || budgets.campaign_over() {
            return self.finish(TestResult::cancelled(artifacts));
        }

        let path = testcase
            .file_path
            .clone()
            .unwrap_or_else(|| self.config_path.clone());
        if let Err(e) = self.renderer.write(testcase, &path) {
            let message = format!("Failed to write configuration {}: {e}", path.display());
            warn!(%message, "Cannot materialize testcase");
            return self.finish(TestResult::error(message, artifacts));
        }
        testcase.file_path = Some(path.clone());
        artifacts.config_path = Some(path.clone());

        if let Some(regression) = &self.regression {
            let outcome = regression.run(testcase, &path, cancel);
            let cancelled = outcome.cancelled;
            artifacts.regression = Some(outcome);
            if cancelled {
                return self.finish(TestResult::cancelled(artifacts));
            }
        }

        let config = path.display().to_string();
        let argv = process::substitute(&self.command, &[(CONFIG_PLACEHOLDER, config.as_str())]);
        let Some(mut cmd) = process::group_command(&argv, self.working_dir.as_deref()) else {
            return self.finish(TestResult::error("Target command is empty", artifacts));
        };
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to spawn command '{:?}': {e}", self.command);
                warn!(%message, "Target did not launch");
                return self.finish(TestResult::error(message, artifacts));
            }
        };
        let pid = child.id();
        artifacts.pid = Some(pid);
        self.transition(ExecState::Running);
        info!(pid, config = %config, "Target launched");

        let started = Instant::now();
        let kill_grace = self.kill_grace;
        // Cancellation must not outlast one sampling interval.
        let cancel_grace = kill_grace.min(self.monitor.interval());
        let (tx, rx) = mpsc::channel();
        let stop = CancelToken::new();
        let stop_ref = &stop;
        let monitor = &mut self.monitor;

        let (verdict, exit, report) = std::thread::scope(|scope| {
            let handle = scope.spawn(move || monitor.run(pid, stop_ref, cancel, tx));
            let verdict = Self::supervise(&mut child, &rx, cancel, budgets);
            stop.cancel();
            let exit = match &verdict {
                Verdict::Exited(status) => {
                    process::kill_group(pid);
                    Some(*status)
                }
                Verdict::Cancelled => process::terminate_group(&mut child, cancel_grace),
                _ => process::terminate_group(&mut child, kill_grace),
            };
            let report: MonitorReport = handle.join().unwrap_or_default();
            (verdict, exit, report)
        });

        artifacts.elapsed = started.elapsed();
        artifacts.peak_cpu_percent = report.peak_cpu_percent;
        artifacts.peak_memory_bytes = report.peak_memory_bytes;
        artifacts.log_growth_bytes = report.log_growth_bytes;
        if let Some(status) = exit {
            let (code, signal) = process::exit_parts(&status);
            artifacts.exit_code = code;
            artifacts.signal = signal;
        }

        let result = match verdict {
            Verdict::Exited(status) if status.success() => TestResult::pass(artifacts),
            Verdict::Exited(_) => TestResult::fail(ExceptionType::None, artifacts),
            Verdict::Breach(breach) => TestResult::fail(breach.into(), artifacts),
            Verdict::TimedOut => TestResult::fail(ExceptionType::Timeout, artifacts),
            Verdict::Cancelled => TestResult::cancelled(artifacts),
            Verdict::WaitFailed(message) => TestResult::error(message, artifacts),
        };
        info!(
            pid,
            status = %result.status,
            exception = %result.exception,
            elapsed = ?result.artifacts.elapsed,
            "Target run finished"
        );
        self.finish(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{ConfItem, ConfType};
    use crate::monitor::Thresholds;
    use crate::monitor::tests::{ScriptedSampler, memory};
    use crate::render::ConfigFormat;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, script: &str, timeout_ms: u64) -> ExecutorSettings {
        ExecutorSettings {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
                "sh".to_string(),
                "{config}".to_string(),
            ],
            timeout_ms,
            poll_interval_ms: 10,
            kill_grace_ms: 100,
            config_path: dir.path().join("site.xml"),
            ..Default::default()
        }
    }

    fn executor(
        settings: &ExecutorSettings,
        samples: Vec<u64>,
        thresholds: Thresholds,
    ) -> SystemTestExecutor<ScriptedSampler> {
        let sampler = ScriptedSampler::new(samples.into_iter().map(memory).collect());
        let monitor = ResourceMonitor::new(sampler, thresholds, Duration::from_millis(20));
        let pinned = vec![ConfItem::new("fs.defaultFS", ConfType::String, "hdfs://127.0.0.1:9000")];
        SystemTestExecutor::new(settings, ConfigRenderer::new(ConfigFormat::Xml, pinned), monitor)
    }

    fn testcase() -> Testcase {
        Testcase::new(vec![ConfItem::new("dfs.replication", ConfType::Int, "3")])
    }

    fn process_gone(pid: u32) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::kill(pid as libc::pid_t, 0) != 0 }
    }

    #[test]
    fn clean_exit_passes_with_rendered_config() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir, "grep -q dfs.replication \"$1\" && grep -q fs.defaultFS \"$1\"", 5_000);
        let mut executor = executor(&settings, vec![10], Thresholds::default());
        let mut testcase = testcase();

        let result = executor.run_test(&mut testcase, &CancelToken::new());
        assert_eq!(result.status, TestStatus::Pass, "{result:?}");
        assert_eq!(result.exception, ExceptionType::None);
        assert_eq!(result.artifacts.exit_code, Some(0));
        assert_eq!(testcase.file_path.as_deref(), Some(dir.path().join("site.xml").as_path()));
        assert_eq!(executor.state(), ExecState::Passed);
    }

    #[test]
    fn non_zero_exit_is_a_plain_failure() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir, "exit 3", 5_000);
        let mut executor = executor(&settings, vec![10], Thresholds::default());
        let result = executor.run_test(&mut testcase(), &CancelToken::new());
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.exception, ExceptionType::None);
        assert_eq!(result.artifacts.exit_code, Some(3));
    }

    #[test]
    fn memory_breach_fails_and_kills_target() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir, "sleep 30", 30_000);
        let limits = Thresholds {
            memory_bytes: Some(1_000),
            ..Thresholds::default()
        };
        let mut executor = executor(&settings, vec![10, 10, 5_000], limits);

        let start = Instant::now();
        let result = executor.run_test(&mut testcase(), &CancelToken::new());
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.exception, ExceptionType::Memory);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(result.artifacts.peak_memory_bytes, 5_000);
        let pid = result.artifacts.pid.unwrap();
        assert!(process_gone(pid), "target {pid} must be terminated");
        assert_eq!(executor.state(), ExecState::Failed(ExceptionType::Memory));
    }

    #[test]
    fn cancellation_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(&dir, "trap '' TERM; sleep 30 & wait", 30_000);
        settings.kill_grace_ms = 5_000;
        let mut executor = executor(&settings, vec![10], Thresholds::default());
        let cancel = CancelToken::new();
        let remote = cancel.clone();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            remote.cancel();
            Instant::now()
        });

        let result = executor.run_test(&mut testcase(), &cancel);
        let returned = Instant::now();
        let cancelled_at = trigger.join().unwrap();
        assert_eq!(result.status, TestStatus::Cancelled);
        let latency = returned.duration_since(cancelled_at);
        assert!(latency < Duration::from_secs(1), "cancel took {latency:?}");
        assert!(process_gone(result.artifacts.pid.unwrap()));
    }

    #[test]
    fn per_test_timeout_is_a_timeout_failure() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir, "sleep 30", 150);
        let mut executor = executor(&settings, vec![10], Thresholds::default());
        let result = executor.run_test(&mut testcase(), &CancelToken::new());
        assert_eq!(result.status, TestStatus::Fail);
        assert_eq!(result.exception, ExceptionType::Timeout);
    }

    #[test]
    fn expired_campaign_deadline_cancels_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir, "true", 5_000);
        let mut executor = executor(&settings, vec![10], Thresholds::default());
        executor.set_deadline(Some(Instant::now()));
        let result = executor.run_test(&mut testcase(), &CancelToken::new());
        assert_eq!(result.status, TestStatus::Cancelled);
        assert!(result.artifacts.pid.is_none());
    }

    #[test]
    fn launch_failure_is_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ExecutorSettings {
            command: vec!["./this_command_does_not_exist_ever_12345.sh".to_string()],
            config_path: dir.path().join("site.xml"),
            ..Default::default()
        };
        let mut executor = executor(&settings, vec![10], Thresholds::default());
        let result = executor.run_test(&mut testcase(), &CancelToken::new());
        assert_eq!(result.status, TestStatus::Error);
        assert!(
            result
                .artifacts
                .message
                .unwrap()
                .contains("Failed to spawn command")
        );
        assert_eq!(executor.state(), ExecState::Errored);
    }

    #[test]
    fn unwritable_config_is_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let mut settings = settings(&dir, "true", 5_000);
        settings.config_path = blocker.join("site.xml");
        let mut executor = executor(&settings, vec![10], Thresholds::default());
        let result = executor.run_test(&mut testcase(), &CancelToken::new());
        assert_eq!(result.status, TestStatus::Error);
        assert!(result.artifacts.pid.is_none());
    }
}
