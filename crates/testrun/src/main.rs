//! run-tests - runs a suite of test files in an isolated environment.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use eyre::{Result, WrapErr};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use testrun::{discover, render, DiscoveryError, Orchestrator, OrchestratorError};
use testrun_core::config::DEFAULT_CONFIG_PATH;
use testrun_core::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Exit code after an interrupt (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "run-tests", about = "Run a test suite in an isolated environment", version)]
struct Cli {
    /// Run only the test with this name
    #[arg(long)]
    name: Option<String>,

    /// Per-test timeout in minutes (0 disables the timeout)
    #[arg(long)]
    timeout_minutes: Option<u32>,

    /// Write junit.xml and summary.json to the report directory
    #[arg(long)]
    generate_report: bool,

    /// Take over the suite environment even if another run holds it
    #[arg(long)]
    force: bool,

    /// Suite name (selects the environment directory)
    #[arg(long)]
    suite: Option<String>,

    /// Config file path (applied on top of .testrun/config)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory containing the test files
    #[arg(long)]
    tests_dir: Option<PathBuf>,

    /// Maximum number of tests running at once
    #[arg(long)]
    parallel: Option<NonZeroUsize>,

    /// List discoverable tests and exit
    #[arg(long)]
    list: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&cli)?;

    let jobs = match discover(&config.tests_dir, &config.test_suffix, cli.name.as_deref()) {
        Ok(jobs) => jobs,
        Err(DiscoveryError::UnknownTest { name, available }) => {
            eprintln!("Unknown test: {name}");
            if available.is_empty() {
                eprintln!("No tests found in {}", config.tests_dir.display());
            } else {
                eprintln!("Available tests:");
                for test in available {
                    eprintln!("  {test}");
                }
            }
            return Ok(1);
        }
        Err(e) => return Err(e).wrap_err("test discovery failed"),
    };

    if cli.list {
        render::print_job_list(&jobs);
        return Ok(0);
    }
    if jobs.is_empty() {
        warn!(dir = %config.tests_dir.display(), suffix = %config.test_suffix, "no tests found");
    }

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

    let orchestrator = Orchestrator::new(config, cancel).with_force(cli.force);
    let result = orchestrator.execute(jobs).await;
    signals.abort();

    match result {
        Ok(outcome) => {
            render::print_summary(&outcome.summary);
            if let Some(reports) = &outcome.reports {
                println!(
                    "Reports: {}, {}",
                    reports.junit.display(),
                    reports.summary.display()
                );
            }
            if let Some(archive) = &outcome.log_archive {
                println!("Logs archived to {}", archive.display());
            }
            Ok(u8::try_from(outcome.exit_code()).unwrap_or(1))
        }
        Err(OrchestratorError::Interrupted { summary }) => {
            render::print_summary(&summary);
            eprintln!("Run interrupted.");
            Ok(EXIT_INTERRUPTED)
        }
        Err(e) => Err(e).wrap_err("test run failed"),
    }
}

/// Build the run config: defaults, then `.testrun/config`, then `--config`,
/// then CLI flags.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::default();

    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        config
            .load_file(default_path)
            .wrap_err_with(|| format!("failed to load {}", default_path.display()))?;
    }
    if let Some(path) = &cli.config {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?;
    }

    if let Some(suite) = &cli.suite {
        config.suite.clone_from(suite);
    }
    if let Some(minutes) = cli.timeout_minutes {
        config.timeout_minutes = minutes;
    }
    if cli.generate_report {
        config.generate_report = true;
    }
    if let Some(dir) = &cli.tests_dir {
        config.tests_dir.clone_from(dir);
    }
    if let Some(parallel) = cli.parallel {
        config.max_parallel = parallel.get();
    }

    config.resolve_paths();
    Ok(config)
}

/// Cancel the run on SIGINT or SIGTERM (ctrl-c elsewhere).
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            warn!("failed to register signal handlers");
            return;
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, stopping run"),
            _ = sigterm.recv() => info!("received SIGTERM, stopping run"),
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to register ctrl-c handler");
            return;
        }
        info!("received ctrl-c, stopping run");
    }

    cancel.cancel();
}
