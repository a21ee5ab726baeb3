use confdrift_core::analyzer::ParamCatalog;
use confdrift_core::cancel::CancelToken;
use confdrift_core::config::ConfdriftConfig;
use confdrift_core::executor::SystemTestExecutor;
use confdrift_core::fuzzer::{Fuzzer, FuzzerOptions};
use confdrift_core::generator::TestcaseGenerator;
use confdrift_core::monitor::{ResourceMonitor, SysinfoSampler};
use confdrift_core::mutator::{MutationContext, MutatorKind};
use confdrift_core::pool::{InMemoryPool, SeedOrigin, SeedPool, load_seed_files};
use confdrift_core::regression::RegressionPhase;
use confdrift_core::render::ConfigRenderer;

use anyhow::Context;
use clap::Parser;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Dependency-aware configuration fuzzer", long_about = None)]
struct Cli {
    /// TOML run configuration.
    #[clap(short, long, value_parser, default_value = "confdrift.toml")]
    config_file: PathBuf,
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Campaign run-time budget in seconds.
    #[clap(long)]
    run_time_secs: Option<u64>,
    /// `smart` or `stacked`.
    #[clap(short, long)]
    mutator: Option<MutatorKind>,
    /// Seed of the campaign RNG, for reproducible runs.
    #[clap(short, long)]
    seed: Option<u64>,
    /// Log filter used when RUST_LOG is not set.
    #[clap(long, default_value = "info")]
    log_level: String,
    /// Where to write the JSON campaign summary; stdout when absent.
    #[clap(short, long)]
    output: Option<PathBuf>,
}

static INTERRUPT: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_interrupt(_signal: libc::c_int) {
    if let Some(token) = INTERRUPT.get() {
        token.cancel();
    }
}

fn install_interrupt_handler(token: CancelToken) {
    if INTERRUPT.set(token).is_err() {
        return;
    }
    let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

fn setup_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let mut config = ConfdriftConfig::load_from_file(&cli.config_file)?;
    if let Some(iterations) = cli.iterations {
        config.fuzzer.max_iterations = iterations;
    }
    if let Some(run_time) = cli.run_time_secs {
        config.fuzzer.run_time_secs = Some(run_time);
    }
    if let Some(mutator) = cli.mutator {
        config.fuzzer.mutator = mutator;
    }
    let rng_seed = cli.seed.or(config.fuzzer.rng_seed).unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_nanos() as u64)
            .unwrap_or_default()
    });
    info!(config = ?cli.config_file, rng_seed, "Loaded run configuration");

    let catalog = ParamCatalog::load_from_file(&config.target.catalog)
        .with_context(|| format!("Failed to load parameter catalog {:?}", config.target.catalog))?;
    let counters = Arc::new(catalog.mutation_counters());
    let context = MutationContext::new(
        catalog.dependency_model(),
        catalog.value_generator().with_int_span(config.fuzzer.int_span),
        Arc::clone(&counters),
    );
    let stacking = Arc::new(AtomicBool::new(config.fuzzer.stacking));
    let generator = TestcaseGenerator::new(
        config.fuzzer.mutator.build(context, stacking),
        config.target.pinned.clone(),
    );

    let renderer = ConfigRenderer::new(config.target.format, config.target.pinned.clone());
    let monitor = ResourceMonitor::new(
        SysinfoSampler::new(),
        config.monitor.thresholds(),
        config.monitor.interval(),
    )
    .with_log_file(config.monitor.log_file.clone());
    let regression = config
        .regression
        .as_ref()
        .map(RegressionPhase::from_settings)
        .transpose()
        .context("Failed to set up the regression phase")?;
    let executor = SystemTestExecutor::new(&config.executor, renderer, monitor).with_regression(regression);

    let mut pool = InMemoryPool::new();
    pool.add(catalog.baseline_seed(), SeedOrigin::Baseline)?;
    let injected = load_seed_files(&mut pool, &config.target.seeds, &catalog)?;
    info!(params = catalog.params().len(), injected, "Seed pool ready");

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let mut fuzzer = Fuzzer::new(
        generator,
        executor,
        Box::new(pool),
        catalog.default_values(),
        counters,
        ChaCha8Rng::seed_from_u64(rng_seed),
        FuzzerOptions::from(&config.fuzzer),
    );
    let summary = fuzzer.run(&cancel)?;
    if cancel.is_cancelled() {
        warn!("Campaign interrupted");
    }

    let json = serde_json::to_string_pretty(&summary).context("Failed to serialize campaign summary")?;
    match cli.output {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("Failed to write summary to {path:?}"))?;
            info!(path = ?path, bugs = summary.bugs.len(), "Campaign summary written");
        }
        None => println!("{json}"),
    }
    Ok(())
}
