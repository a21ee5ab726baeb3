//! Regression test phase run ahead of each system test.
//!
//! Every mutated parameter maps to the regression tests that read it. The
//! tests of all mutated parameters are trimmed by [`TestSelector`] and then run
//! one by one against the rendered configuration.

use crate::cancel::CancelToken;
use crate::input::Testcase;
use crate::process::{self, CONFIG_PLACEHOLDER};
use crate::selection::{Budget, TestSelector, TimingError, TimingTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TEST_PLACEHOLDER: &str = "{test}";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("Failed to read test map {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse test map: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error("Regression command is empty")]
    EmptyCommand,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RegressionSettings {
    /// JSON object mapping a parameter name to its regression tests.
    pub tests_map: PathBuf,
    /// TSV file of per-test timings.
    pub timings: PathBuf,
    /// Command run per test; `{test}` and `{config}` are substituted.
    pub command: Vec<String>,
    #[serde(default = "default_scale_per_test_secs")]
    pub scale_per_test_secs: f64,
    #[serde(default = "default_total_budget")]
    pub total_budget_secs: Budget,
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_scale_per_test_secs() -> f64 {
    10.0
}

fn default_total_budget() -> Budget {
    Budget::Unbounded
}

fn default_test_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegressionOutcome {
    pub selected: usize,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    /// Selected tests never started because the run was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
}

impl RegressionOutcome {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RegressionPhase {
    tests_map: BTreeMap<String, Vec<String>>,
    selector: TestSelector,
    command: Vec<String>,
    test_timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl RegressionPhase {
    pub fn new(
        tests_map: BTreeMap<String, Vec<String>>,
        selector: TestSelector,
        command: Vec<String>,
        test_timeout: Duration,
    ) -> Result<Self, RegressionError> {
        if command.is_empty() {
            return Err(RegressionError::EmptyCommand);
        }
        Ok(Self {
            tests_map,
            selector,
            command,
            test_timeout,
            working_dir: None,
        })
    }

    pub fn from_settings(settings: &RegressionSettings) -> Result<Self, RegressionError> {
        let raw = std::fs::read_to_string(&settings.tests_map).map_err(|source| {
            RegressionError::Io {
                path: settings.tests_map.display().to_string(),
                source,
            }
        })?;
        let tests_map: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw)?;
        let timings = TimingTable::load_from_file(&settings.timings)?;
        let selector = TestSelector::new(
            timings,
            settings.scale_per_test_secs,
            settings.total_budget_secs,
        );
        let mut phase = Self::new(
            tests_map,
            selector,
            settings.command.clone(),
            Duration::from_millis(settings.test_timeout_ms),
        )?;
        phase.working_dir = settings.working_dir.clone();
        Ok(phase)
    }

    /// Tests of every mutated item, grouped by parameter.
    pub fn candidate_tests(&self, testcase: &Testcase) -> BTreeMap<String, Vec<String>> {
        testcase
            .mutated_items()
            .filter_map(|item| {
                self.tests_map
                    .get(&item.name)
                    .map(|tests| (item.name.clone(), tests.clone()))
            })
            .collect()
    }

    pub fn run(&self, testcase: &Testcase, config_path: &Path, cancel: &CancelToken) -> RegressionOutcome {
        let selected = self.selector.select(&self.candidate_tests(testcase));
        let mut queue: Vec<String> = Vec::new();
        for test in selected.into_values().flatten() {
            if !queue.contains(&test) {
                queue.push(test);
            }
        }

        let mut outcome = RegressionOutcome {
            selected: queue.len(),
            ..Default::default()
        };
        if queue.is_empty() {
            return outcome;
        }
        info!(tests = queue.len(), "Running regression phase");

        let config = config_path.display().to_string();
        for (index, test) in queue.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                outcome.skipped = queue.len() - index;
                break;
            }
            match self.run_one(test, &config, cancel) {
                Some(true) => outcome.passed.push(test.clone()),
                Some(false) => {
                    warn!(test = %test, "Regression test failed");
                    outcome.failed.push(test.clone());
                }
                None => {
                    outcome.cancelled = true;
                    outcome.skipped = queue.len() - index - 1;
                    break;
                }
            }
        }
        outcome
    }

    /// `Some(passed)` when the test ran to completion or timed out, `None`
    /// when cancelled.
    fn run_one(&self, test: &str, config: &str, cancel: &CancelToken) -> Option<bool> {
        let argv = process::substitute(
            &self.command,
            &[(TEST_PLACEHOLDER, test), (CONFIG_PLACEHOLDER, config)],
        );
        let mut cmd = process::group_command(&argv, self.working_dir.as_deref())?;
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(test, error = %e, "Failed to launch regression test");
                return Some(false);
            }
        };

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(test, ?status, "Regression test finished");
                    return Some(status.success());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(test, error = %e, "Failed to poll regression test");
                    process::terminate_group(&mut child, Duration::ZERO);
                    return Some(false);
                }
            }
            if cancel.is_cancelled() {
                process::terminate_group(&mut child, Duration::ZERO);
                return None;
            }
            if start.elapsed() > self.test_timeout {
                warn!(test, timeout = ?self.test_timeout, "Regression test timed out");
                process::terminate_group(&mut child, Duration::ZERO);
                return Some(false);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{ConfItem, ConfType};

    fn phase(command: &str, budget: Budget) -> RegressionPhase {
        let tests_map: BTreeMap<String, Vec<String>> = [
            ("a", vec!["ok1", "bad", "slow"]),
            ("b", vec!["ok1", "ok2"]),
            ("c", vec!["ok3"]),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.into_iter().map(String::from).collect()))
        .collect();
        let timings: TimingTable = "ok1\t0.1\nok2\t0.1\nok3\t0.1\nbad\t0.1\nslow\t99\n".parse().unwrap();
        RegressionPhase::new(
            tests_map,
            TestSelector::new(timings, 10.0, budget),
            vec!["sh".to_string(), "-c".to_string(), command.to_string()],
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn testcase() -> Testcase {
        let mut a = ConfItem::new("a", ConfType::Int, "1");
        a.mutated = true;
        let mut b = ConfItem::new("b", ConfType::Int, "2");
        b.mutated = true;
        Testcase::new(vec![a, b, ConfItem::new("c", ConfType::Int, "3")])
    }

    #[test]
    fn only_mutated_parameters_contribute_tests() {
        let phase = phase("true", Budget::Unbounded);
        let candidates = phase.candidate_tests(&testcase());
        assert_eq!(candidates.len(), 2);
        assert!(!candidates.contains_key("c"));
    }

    #[test]
    fn failing_tests_are_reported_and_duplicates_run_once() {
        let phase = RegressionPhase {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "test \"$1\" != bad".to_string(),
                "sh".to_string(),
                "{test}".to_string(),
            ],
            ..phase("true", Budget::Unbounded)
        };
        let outcome = phase.run(&testcase(), Path::new("/tmp/x.xml"), &CancelToken::new());
        assert_eq!(outcome.selected, 3);
        assert_eq!(outcome.failed, vec!["bad"]);
        assert_eq!(outcome.passed, vec!["ok1", "ok2"]);
        assert!(outcome.has_failures());
        assert!(!outcome.cancelled);
    }

    #[test]
    fn config_path_reaches_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("seen");
        let script = format!("echo {{config}} >> {}", marker.display());
        let outcome = phase(&script, Budget::Unbounded).run(
            &testcase(),
            Path::new("/tmp/site.xml"),
            &CancelToken::new(),
        );
        assert!(outcome.failed.is_empty());
        let seen = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(seen.lines().count(), 3);
        assert!(seen.lines().all(|line| line == "/tmp/site.xml"));
    }

    #[test]
    fn cancelled_phase_skips_everything() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = phase("true", Budget::Unbounded).run(&testcase(), Path::new("/tmp/x"), &cancel);
        assert!(outcome.cancelled);
        assert_eq!(outcome.skipped, 3);
        assert!(outcome.passed.is_empty());
    }

    #[test]
    fn settings_load_map_and_timings() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("map.json");
        let times = dir.path().join("times.tsv");
        std::fs::write(&map, r#"{"a": ["t1", "t2"]}"#).unwrap();
        std::fs::write(&times, "t1\t1\t3\nt2\t4\n").unwrap();
        let raw = format!(
            "tests-map = \"{}\"\ntimings = \"{}\"\ncommand = [\"true\"]\ntotal-budget-secs = 2.5\n",
            map.display(),
            times.display()
        );
        let settings: RegressionSettings = toml::from_str(&raw).unwrap();
        assert_eq!(settings.total_budget_secs, Budget::Seconds(2.5));
        let phase = RegressionPhase::from_settings(&settings).unwrap();
        assert_eq!(phase.selector.timings().get("t1"), Some(2.0));

        let empty = RegressionSettings {
            command: Vec::new(),
            ..settings
        };
        assert!(matches!(
            RegressionPhase::from_settings(&empty),
            Err(RegressionError::EmptyCommand)
        ));
    }
}
