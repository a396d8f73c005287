use clap::{ArgAction, Parser};
use ipp_runner::{
    config::{BackendConfig, ConfigErrors, RunnerConfig},
    ledger::{Ledger, LedgerLock},
    remote::ApiClient,
    retry::RetryConfig,
    scheduler::{BackendKind, Backends},
    tracker::Tracker,
    tunnel::Tunnel,
};
use std::{collections::BTreeMap, path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// Runs experiments handed out by the queue service on docker or slurm backends
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Runner configuration file
    #[arg(short, long, default_value = "runner.yaml")]
    config: PathBuf,

    /// Fetch pending experiments and submit them
    #[arg(long)]
    submit: bool,

    /// Ship the results of every tracked job that terminated
    #[arg(long)]
    status: bool,

    /// Run every experiment on this backend, ignoring its host label
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Scheduler to attach the forced backend to (docker host, slurm cluster)
    #[arg(long, requires = "backend")]
    contact: Option<String>,

    /// Block until the jobs submitted by this invocation terminated
    #[arg(long, requires = "submit")]
    wait: bool,

    /// Increase log verbosity, RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if !cli.submit && !cli.status {
        error!("Nothing to do, pass --submit and/or --status");
        return ExitCode::FAILURE;
    }

    let config = RunnerConfig::load(&cli.config).unwrap_or_log();
    if config.preflight_checks() {
        error!("{}", ConfigErrors::PreflightFailed);
        return ExitCode::FAILURE;
    }
    let layout = config.current_layout().unwrap_or_log();

    // one invocation at a time may touch the ledger
    let _lock = LedgerLock::acquire(&layout.ledger).unwrap_or_log();
    let ledger = Ledger::load(&layout.ledger).unwrap_or_log();

    let tunnel = config
        .api
        .tunnel
        .as_ref()
        .map(Tunnel::open)
        .transpose()
        .unwrap_or_log();
    let url = tunnel
        .as_ref()
        .map(Tunnel::api_url)
        .unwrap_or_else(|| config.api.url.clone());
    info!(url = %url, "Using queue service");

    let remote = ApiClient::new(
        &url,
        Duration::from_millis(config.api.timeout_ms),
        RetryConfig::from(&config.api.retry),
    )
    .unwrap_or_log();

    let forced = cli.backend.map(|kind| BackendConfig {
        kind,
        contact: cli.contact.clone(),
        parameter: BTreeMap::new(),
    });
    let backends = Backends::load(&config, forced);

    let mut tracker = Tracker::new(layout, ledger, backends, remote)
        .with_session(&config.session)
        .with_poll_interval(config.poll_interval());

    let mut failed = false;

    if cli.status {
        match tracker.reconcile() {
            Ok(report) => failed |= !report.failed.is_empty(),
            Err(error) => {
                error!(error = %error, "Reconciliation failed");
                failed = true;
            }
        }
    }

    if cli.submit {
        match tracker.submit_pending() {
            Ok(report) => {
                failed |= !report.failed.is_empty();

                if cli.wait {
                    for (experiment, job) in report.submitted {
                        info!(experiment = experiment, job = %job, "Waiting for job");

                        if let Err(error) = tracker.wait_for(&job) {
                            error!(job = %job, error = %error, "Failed to wait for job");
                            failed = true;
                        }
                    }
                }
            }
            Err(error) => {
                error!(error = %error, "Submission failed");
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
