use crate::input::ConfItem;
use crate::monitor::MonitorSettings;
use crate::mutator::MutatorKind;
use crate::regression::RegressionSettings;
use crate::render::ConfigFormat;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_iterations")]
    pub max_iterations: u64,
    /// Campaign run-time budget; unlimited when absent.
    #[serde(default)]
    pub run_time_secs: Option<u64>,
    #[serde(default)]
    pub mutator: MutatorKind,
    /// Makes the smart mutator perturb every item per round.
    #[serde(default)]
    pub stacking: bool,
    #[serde(default)]
    pub rng_seed: Option<u64>,
    #[serde(default = "default_int_span")]
    pub int_span: i64,
    #[serde(default = "default_trim_failures")]
    pub trim_failures: bool,
    #[serde(default)]
    pub trim_max_oracle_calls: Option<usize>,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

pub fn default_iterations() -> u64 {
    1_000
}

fn default_int_span() -> i64 {
    1024
}

fn default_trim_failures() -> bool {
    true
}

fn default_stats_interval_secs() -> u64 {
    30
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_iterations(),
            run_time_secs: None,
            mutator: MutatorKind::default(),
            stacking: false,
            rng_seed: None,
            int_span: default_int_span(),
            trim_failures: default_trim_failures(),
            trim_max_oracle_calls: None,
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    /// TOML parameter catalog of the target.
    pub catalog: PathBuf,
    #[serde(default)]
    pub format: ConfigFormat,
    /// Items that are never mutated and always rendered.
    #[serde(default)]
    pub pinned: Vec<ConfItem>,
    /// Extra seed files injected into the pool before fuzzing.
    #[serde(default)]
    pub seeds: Vec<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    /// Target command line; `{config}` is replaced by the rendered file.
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_kill_grace_ms() -> u64 {
    2_000
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("./.confdrift/confdrift-site.xml")
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            working_dir: None,
            timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            config_path: default_config_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ConfdriftConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    pub target: TargetSettings,
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub regression: Option<RegressionSettings>,
}

impl ConfdriftConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {path:?}"))?;
        let mut config: ConfdriftConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML from config file {path:?}"))?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        config.validate()?;
        Ok(config)
    }

    /// Makes every file path in the configuration relative to `base`.
    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.target.catalog);
        self.target.seeds.iter_mut().for_each(resolve);
        resolve(&mut self.executor.config_path);
        if let Some(log_file) = self.monitor.log_file.as_mut() {
            resolve(log_file);
        }
        if let Some(regression) = self.regression.as_mut() {
            resolve(&mut regression.tests_map);
            resolve(&mut regression.timings);
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.executor.command.is_empty() {
            anyhow::bail!("executor.command must name the target to launch");
        }
        if self.fuzzer.int_span <= 0 {
            anyhow::bail!("fuzzer.int-span must be positive");
        }
        Ok(())
    }
}
