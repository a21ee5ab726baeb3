//! The fuzzing loop.
//!
//! One coordinating thread pulls a seed, mutates it, executes the testcase
//! and feeds the outcome back: passing novel testcases are re-seeded, failing
//! ones are reported, trimmed to a minimal reproducer and the reproducer is
//! re-seeded. A bad round is logged and skipped; only cancellation, the
//! run-time budget, the iteration budget or an empty pool end the campaign.

use crate::cancel::CancelToken;
use crate::config::FuzzerSettings;
use crate::dependency::MutationCounters;
use crate::executor::Executor;
use crate::feedback::{Feedback, FeedbackError, UniqueInputFeedback};
use crate::generator::TestcaseGenerator;
use crate::input::{ConfItem, Input, Testcase};
use crate::oracle::{BugReport, FailureOracle, Oracle, same_failure};
use crate::pool::{SeedOrigin, SeedPool};
use crate::result::{TestResult, TestStatus};
use crate::stats::{self, FuzzStats, StatsSnapshot};
use crate::trimmer::ConfigTrimmer;
use rand_core::RngCore;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Seed pool is empty, nothing to fuzz")]
    EmptyPool,
    #[error("Feedback initialization failed: {0}")]
    Feedback(#[from] FeedbackError),
}

#[derive(Debug, Clone)]
pub struct FuzzerOptions {
    pub max_iterations: u64,
    pub run_time: Option<Duration>,
    pub trim_failures: bool,
    pub trim_max_oracle_calls: Option<usize>,
    /// No periodic progress logging when `None`.
    pub stats_interval: Option<Duration>,
}

impl Default for FuzzerOptions {
    fn default() -> Self {
        Self::from(&FuzzerSettings::default())
    }
}

impl From<&FuzzerSettings> for FuzzerOptions {
    fn from(settings: &FuzzerSettings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            run_time: settings.run_time_secs.map(Duration::from_secs),
            trim_failures: settings.trim_failures,
            trim_max_oracle_calls: settings.trim_max_oracle_calls,
            stats_interval: (settings.stats_interval_secs > 0)
                .then(|| Duration::from_secs(settings.stats_interval_secs)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    IterationsExhausted,
    RunTimeElapsed,
    Cancelled,
    PoolExhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Minimized {
    pub testcase: Testcase,
    pub kept: Vec<ConfItem>,
    pub deviations_before: usize,
    pub oracle_calls: usize,
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FoundBug {
    pub iteration: u64,
    pub description: String,
    pub input_hash: String,
    pub severity: u8,
    pub result: TestResult,
    pub testcase: Testcase,
    /// Absent when trimming is disabled or the failure did not reproduce.
    pub minimized: Option<Minimized>,
}

/// What a campaign leaves behind for the result sink.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignSummary {
    pub stop_reason: StopReason,
    pub stats: StatsSnapshot,
    pub bugs: Vec<FoundBug>,
    pub mutation_counts: BTreeMap<String, u64>,
}

pub struct Fuzzer<E: Executor, R: RngCore> {
    generator: TestcaseGenerator<R>,
    executor: E,
    pool: Box<dyn SeedPool>,
    feedback: Box<dyn Feedback>,
    oracle: Box<dyn Oracle<Testcase>>,
    trimmer: ConfigTrimmer,
    defaults: HashMap<String, String>,
    counters: Arc<MutationCounters>,
    stats: Arc<FuzzStats>,
    rng: R,
    options: FuzzerOptions,
}

impl<E: Executor, R: RngCore> Fuzzer<E, R> {
    pub fn new(
        generator: TestcaseGenerator<R>,
        executor: E,
        pool: Box<dyn SeedPool>,
        defaults: HashMap<String, String>,
        counters: Arc<MutationCounters>,
        rng: R,
        options: FuzzerOptions,
    ) -> Self {
        Self {
            generator,
            executor,
            pool,
            feedback: Box::new(UniqueInputFeedback::new()),
            oracle: Box::new(FailureOracle::new()),
            trimmer: ConfigTrimmer::new(options.trim_max_oracle_calls),
            defaults,
            counters,
            stats: Arc::new(FuzzStats::new()),
            rng,
            options,
        }
    }

    pub fn with_feedback(mut self, feedback: Box<dyn Feedback>) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_oracle(mut self, oracle: Box<dyn Oracle<Testcase>>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Shared handle to the live counters.
    pub fn stats(&self) -> Arc<FuzzStats> {
        Arc::clone(&self.stats)
    }

    pub fn pool(&self) -> &dyn SeedPool {
        self.pool.as_ref()
    }

    pub fn run(&mut self, cancel: &CancelToken) -> Result<CampaignSummary, FuzzError> {
        if self.pool.is_empty() {
            return Err(FuzzError::EmptyPool);
        }
        self.feedback.init(self.pool.as_ref())?;
        self.stats.set_pool_size(self.pool.len());

        let start = Instant::now();
        let deadline = self.options.run_time.map(|budget| start + budget);
        self.executor.set_deadline(deadline);

        let reporter_stop = CancelToken::new();
        let reporter = self
            .options
            .stats_interval
            .map(|interval| stats::spawn_reporter(self.stats(), interval, reporter_stop.clone()));

        info!(
            max_iterations = self.options.max_iterations,
            run_time = ?self.options.run_time,
            mutator = self.generator.mutator_name(),
            seeds = self.pool.len(),
            "Starting fuzzing campaign"
        );

        let mut bugs = Vec::new();
        let mut reported = HashSet::new();
        let mut stop_reason = StopReason::IterationsExhausted;

        for iteration in 0..self.options.max_iterations {
            if cancel.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                stop_reason = StopReason::RunTimeElapsed;
                break;
            }
            self.stats.record_iteration();

            let (parent, seed) = match self.pool.next(&mut self.rng) {
                Ok((id, seed)) => (id, seed.clone()),
                Err(e) => {
                    error!(error = %e, "Could not pick a seed");
                    stop_reason = StopReason::PoolExhausted;
                    break;
                }
            };

            let mut testcase = match self.generator.generate(&seed, &mut self.rng) {
                Ok(testcase) => testcase,
                Err(e) => {
                    warn!(iteration, parent, error = %e, "Mutation failed, skipping round");
                    self.stats.record_skipped_round();
                    continue;
                }
            };
            if testcase.is_empty() {
                debug!(iteration, parent, "Empty testcase, skipping round");
                self.stats.record_skipped_round();
                continue;
            }

            let result = self.executor.run_test(&mut testcase, cancel);
            self.stats.record_execution(result.status);
            match result.status {
                TestStatus::Cancelled => {
                    stop_reason = if cancel.is_cancelled() {
                        StopReason::Cancelled
                    } else {
                        StopReason::RunTimeElapsed
                    };
                    break;
                }
                TestStatus::Error => {
                    warn!(
                        iteration,
                        message = result.artifacts.message.as_deref().unwrap_or(""),
                        "Execution error"
                    );
                    continue;
                }
                TestStatus::Pass | TestStatus::Fail => {}
            }

            if let Some(report) = self.oracle.examine(&testcase, &result) {
                if let Some(bug) = self.handle_bug(report, iteration, parent, cancel, &mut reported) {
                    bugs.push(bug);
                }
            } else {
                self.reseed(testcase, &result, parent);
            }
            self.stats.set_pool_size(self.pool.len());
        }

        reporter_stop.cancel();
        if let Some(handle) = reporter {
            if handle.join().is_err() {
                warn!("Stats reporter thread panicked");
            }
        }

        let summary = CampaignSummary {
            stop_reason,
            stats: self.stats.snapshot(),
            bugs,
            mutation_counts: self.counters.snapshot(),
        };
        info!(
            ?stop_reason,
            executions = summary.stats.executions,
            bugs = summary.bugs.len(),
            pool = summary.stats.pool_size,
            elapsed = ?start.elapsed(),
            "Fuzzing campaign finished"
        );
        Ok(summary)
    }

    fn reseed(&mut self, testcase: Testcase, result: &TestResult, parent: usize) {
        match self.feedback.is_interesting(&testcase, result) {
            Ok(true) => {
                let origin = SeedOrigin::Mutated { parent };
                if let Err(e) = self.feedback.report_interesting(testcase, origin, self.pool.as_mut()) {
                    warn!(error = %e, "Could not re-seed testcase");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Feedback failed"),
        }
    }

    fn handle_bug(
        &mut self,
        report: BugReport<Testcase>,
        iteration: u64,
        parent: usize,
        cancel: &CancelToken,
        reported: &mut HashSet<[u8; 16]>,
    ) -> Option<FoundBug> {
        warn!(
            iteration,
            description = %report.description,
            hash = %report.input_hash,
            "Bug found"
        );

        let minimized = if self.options.trim_failures {
            self.trim(&report, cancel)
        } else {
            None
        };

        let key = minimized
            .as_ref()
            .map_or_else(|| report.input.fingerprint(), |m| m.testcase.fingerprint());
        if !reported.insert(key) {
            debug!(hash = %report.input_hash, "Failure already reported");
            return None;
        }
        self.stats.record_bug();

        if let Some(minimized) = &minimized {
            let origin = SeedOrigin::Minimized { parent };
            if let Err(e) =
                self.feedback
                    .report_interesting(minimized.testcase.clone(), origin, self.pool.as_mut())
            {
                warn!(error = %e, "Could not re-seed minimized testcase");
            }
        }

        Some(FoundBug {
            iteration,
            description: report.description,
            input_hash: report.input_hash,
            severity: report.severity,
            result: report.result,
            testcase: report.input,
            minimized,
        })
    }

    /// Re-executes reduced variants of the failing testcase until a minimal
    /// reproducer is found.
    fn trim(&mut self, report: &BugReport<Testcase>, cancel: &CancelToken) -> Option<Minimized> {
        let original = &report.result;
        let executor = &mut self.executor;
        let stats = &self.stats;
        let outcome = self.trimmer.trim(&report.input, &self.defaults, |candidate| {
            if cancel.is_cancelled() {
                return false;
            }
            let mut candidate = candidate.clone();
            let result = executor.run_test(&mut candidate, cancel);
            stats.record_execution(result.status);
            same_failure(original, &result)
        });
        if !outcome.reproduced {
            info!(hash = %report.input_hash, "Failure not reproducible, keeping it untrimmed");
            return None;
        }
        self.stats.record_trim();
        Some(Minimized {
            testcase: outcome.testcase,
            kept: outcome.kept,
            deviations_before: outcome.deviations_before,
            oracle_calls: outcome.oracle_calls,
            budget_exhausted: outcome.budget_exhausted,
        })
    }
}
