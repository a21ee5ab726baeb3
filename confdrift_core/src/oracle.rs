use crate::input::Input;
use crate::result::{ExceptionType, TestResult, TestStatus};

/// Severity of a plain non-zero exit.
const DEFAULT_FAILURE_SEVERITY: u8 = 10;

/// A failure worth keeping, together with the configuration that caused it.
#[derive(Debug, Clone)]
pub struct BugReport<I: Input> {
    /// The configuration that triggered this failure.
    pub input: I,
    pub description: String,
    /// Hex md5 of the canonical configuration bytes, for deduplication.
    pub input_hash: String,
    pub severity: u8,
    pub result: TestResult,
}

/// An `Oracle` decides from a run's outcome whether a bug has been found.
pub trait Oracle<I: Input>: Send + Sync {
    fn examine(&self, input: &I, result: &TestResult) -> Option<BugReport<I>>;
}

/// Reports every failed system test and every run whose regression phase had
/// failing tests.
#[derive(Debug, Default)]
pub struct FailureOracle;

impl FailureOracle {
    pub fn new() -> Self {
        FailureOracle
    }

    fn severity(exception: ExceptionType) -> u8 {
        match exception {
            ExceptionType::Memory | ExceptionType::Cpu => DEFAULT_FAILURE_SEVERITY + 2,
            ExceptionType::LogGrowth => DEFAULT_FAILURE_SEVERITY + 1,
            ExceptionType::Timeout => DEFAULT_FAILURE_SEVERITY - 2,
            ExceptionType::None => DEFAULT_FAILURE_SEVERITY,
        }
    }
}

impl<I: Input> Oracle<I> for FailureOracle {
    fn examine(&self, input: &I, result: &TestResult) -> Option<BugReport<I>> {
        let description = match result.status {
            TestStatus::Fail => match (result.exception, result.artifacts.exit_code, result.artifacts.signal) {
                (ExceptionType::None, Some(code), _) => format!("Target exited with code {code}"),
                (ExceptionType::None, None, Some(signal)) => format!("Target terminated by signal {signal}"),
                (ExceptionType::None, None, None) => "Target exited abnormally".to_string(),
                (exception, _, _) => format!("Resource exception: {exception}"),
            },
            _ => {
                let failed = result
                    .artifacts
                    .regression
                    .as_ref()
                    .filter(|outcome| outcome.has_failures())?;
                format!("Regression tests failed: {}", failed.failed.join(", "))
            }
        };
        Some(BugReport {
            input: input.clone(),
            description,
            input_hash: format!("{:x}", md5::compute(input.as_bytes())),
            severity: Self::severity(result.exception),
            result: result.clone(),
        })
    }
}

/// Whether `candidate` reproduces the failure recorded in `original`.
///
/// Two failures match when their status and exception agree, plus the exit
/// code and signal for failures without a resource exception; when `original` carried regression failures the candidate must fail the
/// same regression tests.
pub fn same_failure(original: &TestResult, candidate: &TestResult) -> bool {
    let regression_failures = |result: &TestResult| {
        result
            .artifacts
            .regression
            .as_ref()
            .map(|outcome| outcome.failed.clone())
            .unwrap_or_default()
    };
    let expected = regression_failures(original);
    if !expected.is_empty() {
        let observed = regression_failures(candidate);
        return expected.iter().all(|test| observed.contains(test));
    }
    original.failure_signature().is_some()
        && original.failure_signature() == candidate.failure_signature()
}
