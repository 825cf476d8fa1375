#![forbid(unsafe_code)]

mod config;
mod defaults;
mod passes;

use clap::Parser;
use config::{RunnerError, load_config, select_jobs};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tk_core::PassOptions;
use tk_core::engine::DEFAULT_LOCK_TTL_MS;
use tk_storage::SqliteStore;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Runs tree-consistency passes (mirror reconciliation and link repair)
/// against a hierarchy store.
#[derive(Debug, Parser)]
#[command(name = "tk_runner")]
#[command(version)]
struct Cli {
    /// Store directory [default: <repo root>/.treekeeper]
    #[arg(long, env = "TK_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// YAML job file [default: <repo root>/treekeeper.yaml]
    #[arg(long, env = "TK_CONFIG")]
    config: Option<PathBuf>,

    /// Run only the named job
    #[arg(long, env = "TK_JOB")]
    job: Option<String>,

    /// Lock holder recorded on the pass lease [default: tk_runner:<pid>]
    #[arg(long, env = "TK_HOLDER")]
    holder: Option<String>,

    /// Pass lease lifetime; the store clamps it to 1s..10min
    #[arg(long, env = "TK_LOCK_TTL_MS", default_value_t = DEFAULT_LOCK_TTL_MS)]
    lock_ttl_ms: u64,

    /// How long to wait for a busy lock before giving up (0 fails fast)
    #[arg(long, env = "TK_LOCK_WAIT_MS", default_value_t = 0)]
    lock_wait_ms: u64,

    /// Compute and report staged ops without applying them
    #[arg(long, env = "TK_DRY_RUN")]
    dry_run: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, env = "TK_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn resolve_holder(holder: Option<&str>) -> String {
    holder
        .map(str::trim)
        .filter(|holder| !holder.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("tk_runner:{}", std::process::id()))
}

fn run(cli: Cli) -> Result<bool, RunnerError> {
    let cwd = std::env::current_dir().map_err(|source| RunnerError::Read {
        path: PathBuf::from("."),
        source,
    })?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| defaults::default_config_from_start(&cwd));
    let storage_dir = cli
        .storage_dir
        .clone()
        .unwrap_or_else(|| defaults::default_storage_dir_from_start(&cwd));

    let config = load_config(&config_path)?;
    let jobs = select_jobs(&config.jobs, cli.job.as_deref())?;
    tracing::info!(
        config = %config_path.display(),
        storage = %storage_dir.display(),
        jobs = jobs.len(),
        dry_run = cli.dry_run,
        "runner starting"
    );

    let mut store = SqliteStore::open(&storage_dir)?;
    let options = PassOptions {
        holder: resolve_holder(cli.holder.as_deref()),
        lock_ttl_ms: cli.lock_ttl_ms,
        dry_run: cli.dry_run,
        ..PassOptions::default()
    };
    let runs = passes::run_jobs(
        &mut store,
        &jobs,
        &options,
        Duration::from_millis(cli.lock_wait_ms),
        &config.digest,
    );

    for run in &runs {
        println!("{}", run.to_json());
    }
    let failed = runs.iter().filter(|run| run.failed()).count();
    tracing::info!(jobs = runs.len(), failed, "runner finished");
    Ok(failed == 0)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            tracing::error!(error = %err, "runner aborted");
            eprintln!("tk_runner: {err}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests;
