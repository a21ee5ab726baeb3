pub mod analyzer;
pub mod cancel;
pub mod config;
pub mod dependency;
pub mod executor;
pub mod feedback;
pub mod fuzzer;
pub mod generator;
pub mod input;
pub mod monitor;
pub mod mutator;
pub mod oracle;
pub mod pool;
pub mod process;
pub mod regression;
pub mod render;
pub mod result;
pub mod selection;
pub mod stats;
pub mod trimmer;
pub mod value;

pub use analyzer::{CatalogError, ParamCatalog};
pub use cancel::CancelToken;
pub use config::ConfdriftConfig;
pub use dependency::{ConstraintKind, DependencyModel, MutationCounters, Relation};
pub use executor::{Executor, SystemTestExecutor};
pub use feedback::{Feedback, FeedbackError, UniqueInputFeedback};
pub use fuzzer::{CampaignSummary, FuzzError, Fuzzer, FuzzerOptions, StopReason};
pub use generator::TestcaseGenerator;
pub use input::{ConfItem, ConfType, Input, Seed, Testcase};
pub use monitor::{ResourceMonitor, ResourceSampler, SysinfoSampler};
pub use mutator::{MutationContext, MutationError, Mutator, MutatorKind};
pub use oracle::{BugReport, FailureOracle, Oracle};
pub use pool::{InMemoryPool, PoolError, SeedOrigin, SeedPool};
pub use regression::RegressionPhase;
pub use render::{ConfigFormat, ConfigRenderer};
pub use result::{ExceptionType, TestResult, TestStatus};
pub use selection::{Budget, TestSelector, TimingTable};
pub use trimmer::{ConfigTrimmer, TrimOutcome};
pub use value::{ValueError, ValueGenerator};
