mod collector;
mod config;
mod executors;
mod ingest;
mod results;
mod supervisor;
mod sync;

use clap::Parser;
use config::{HarnessConfig, RunConfiguration, SolverEngine, SolvingMethod};
use executors::{ExecutorError, LocalExecutor};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use results::{Aggregator, ResultTable};
use std::{
    path::PathBuf,
    process::exit,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Benchmark harness for the BCP solver
#[derive(Parser, Debug)]
#[command(name = "bcpbench", version, about)]
struct Cli {
    /// method for solving the BCP problem
    #[arg(value_enum)]
    solving_method: SolvingMethod,

    /// time limit in seconds passed to the solver for one instance
    #[arg(long)]
    time_limit: Option<u64>,

    /// result file to seed the result table from, already completed
    /// instances are skipped
    #[arg(long)]
    continue_from: Option<PathBuf>,

    /// number of concurrently supervised solver processes
    #[arg(long)]
    jobs: Option<usize>,

    /// seconds between periodic partial result exports
    #[arg(long)]
    save_interval: Option<u64>,

    /// use predefined upper bounds from the bound files
    #[arg(long)]
    use_predefined_upper_bound: bool,

    /// use the incremental solving strategy (if applicable)
    #[arg(long)]
    use_incremental_solving: bool,

    /// incremental variable selector, only meaningful with incremental
    /// solving
    #[arg(long)]
    incremental_var: Option<String>,

    /// use symmetry breaking in the solving process
    #[arg(long)]
    use_symmetry_breaking: bool,

    /// enable heuristics while encoding, if applicable
    #[arg(long)]
    use_heuristics: bool,

    /// underlying SAT solver engine
    #[arg(long, value_enum, default_value_t = SolverEngine::Cadical)]
    solver: SolverEngine,

    /// path to an optional YAML file describing the harness environment
    #[arg(long)]
    config: Option<PathBuf>,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signal: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_interrupt_handler() -> Result<(), nix::Error> {
    let action = SigAction::new(
        SigHandler::Handler(handle_sigint),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe { sigaction(Signal::SIGINT, &action) }.map(|_| ())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = install_interrupt_handler() {
        error!("Failed to install the interrupt handler: {e}");
        exit(1);
    }

    let mut harness = match HarnessConfig::load(cli.config.as_deref()) {
        Ok(harness) => harness,
        Err(e) => {
            error!("Failed to load harness config: {e}");
            exit(1);
        }
    };
    if let Some(jobs) = cli.jobs {
        harness.jobs = jobs;
    }
    if let Some(interval) = cli.save_interval {
        harness.save_interval_seconds = interval;
    }

    if harness.preflight_checks(cli.use_predefined_upper_bound) {
        exit(1);
    }

    let run = RunConfiguration {
        solver_exec: harness.solver_exec.clone(),
        method: cli.solving_method,
        time_limit: cli.time_limit,
        incremental: cli.use_incremental_solving,
        incremental_var: cli.incremental_var,
        symmetry_breaking: cli.use_symmetry_breaking,
        heuristics: cli.use_heuristics,
        engine: cli.solver,
    };

    let seed = match cli.continue_from {
        Some(ref path) => match ResultTable::load_csv(path) {
            Ok(seed) => {
                info!(
                    "Resuming with {} completed instances from {}",
                    seed.len(),
                    path.to_string_lossy()
                );
                seed
            }
            Err(e) => {
                error!("Failed to load checkpoint: {e}");
                exit(1);
            }
        },
        None => ResultTable::new(),
    };

    let instances = match collector::collect_instances(
        &harness,
        run.method,
        cli.use_predefined_upper_bound,
        &seed,
    ) {
        Ok(instances) => instances,
        Err(e) => {
            error!("Failed to build the instance queue: {e}");
            exit(1);
        }
    };
    info!("Queued {} instances", instances.len());

    let mut aggregator = Aggregator::new(
        run.clone(),
        harness.result_dir.clone(),
        Duration::from_secs(harness.save_interval_seconds),
        seed,
    );
    let executor = LocalExecutor::new(run, harness.jobs);

    match executor.execute(instances, &mut aggregator, &INTERRUPTED) {
        Ok(()) => match aggregator.export(None) {
            Ok(path) => info!("Benchmark finished, results at {}", path.to_string_lossy()),
            Err(e) => {
                error!("Failed to export final results: {e}");
                exit(1);
            }
        },
        Err(ExecutorError::Interrupted) => {
            error!("Benchmark interrupted, flushing completed results");
            best_effort_export(&aggregator, "interrupted");
            exit(1);
        }
        Err(e) => {
            error!("Benchmark halted: {e}");
            best_effort_export(&aggregator, "crash");
            exit(1);
        }
    }
}

/// the batch is going down, the snapshot is the recovery artifact but its
/// failure must not mask the original diagnostics
fn best_effort_export(aggregator: &Aggregator, suffix: &str) {
    match aggregator.export(Some(suffix)) {
        Ok(path) => info!(
            "Saved {suffix} snapshot to {}",
            path.to_string_lossy()
        ),
        Err(e) => error!("Failed to save the {suffix} snapshot: {e}"),
    }
}
