use crate::regression::RegressionOutcome;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Cancelled,
}

/// Which resource breach, if any, ended a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionType {
    None,
    Cpu,
    Memory,
    LogGrowth,
    Timeout,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Error => "error",
            TestStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExceptionType::None => "none",
            ExceptionType::Cpu => "cpu",
            ExceptionType::Memory => "memory",
            ExceptionType::LogGrowth => "log-growth",
            ExceptionType::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Everything observed about one execution besides its classification.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Artifacts {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub pid: Option<u32>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub peak_cpu_percent: f32,
    pub peak_memory_bytes: u64,
    pub log_growth_bytes: u64,
    pub config_path: Option<PathBuf>,
    pub message: Option<String>,
    pub regression: Option<RegressionOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub status: TestStatus,
    pub exception: ExceptionType,
    pub artifacts: Artifacts,
}

impl TestResult {
    pub fn pass(artifacts: Artifacts) -> Self {
        Self {
            status: TestStatus::Pass,
            exception: ExceptionType::None,
            artifacts,
        }
    }

    pub fn fail(exception: ExceptionType, artifacts: Artifacts) -> Self {
        Self {
            status: TestStatus::Fail,
            exception,
            artifacts,
        }
    }

    pub fn error(message: impl Into<String>, mut artifacts: Artifacts) -> Self {
        artifacts.message = Some(message.into());
        Self {
            status: TestStatus::Error,
            exception: ExceptionType::None,
            artifacts,
        }
    }

    pub fn cancelled(artifacts: Artifacts) -> Self {
        Self {
            status: TestStatus::Cancelled,
            exception: ExceptionType::None,
            artifacts,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status == TestStatus::Fail
    }

    /// Key used to decide whether two failures are the same bug.
    ///
    /// Resource exceptions end with the fuzzer killing the target, so the exit
    /// code and signal only take part when the target failed on its own.
    pub fn failure_signature(&self) -> Option<(ExceptionType, Option<i32>, Option<i32>)> {
        if !self.is_failure() {
            return None;
        }
        Some(match self.exception {
            ExceptionType::None => (self.exception, self.artifacts.exit_code, self.artifacts.signal),
            exception => (exception, None, None),
        })
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
