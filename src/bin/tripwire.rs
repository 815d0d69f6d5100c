//! tripwire daemon
//!
//! Runs the full pipeline over the in-memory store, seeded from a fixtures
//! file, until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tripwire::config::{self, LogConfig, LogFormat};
use tripwire::{Config, Fixtures, InMemoryStore, PipelineBuilder, ShutdownSignal, Store, TripwireError};

/// How often the counters are logged while running.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "tripwire", about = "Streaming metrics alerting daemon", version)]
struct Args {
    /// YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML file with triggers, contacts and subscriptions to load.
    #[arg(short, long)]
    fixtures: Option<PathBuf>,

    /// Print the default configuration and exit.
    #[arg(long)]
    default_config: bool,
}

fn init_logging(cfg: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match cfg.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn load_store(path: Option<&PathBuf>) -> Result<InMemoryStore, TripwireError> {
    let Some(path) = path else {
        return Ok(InMemoryStore::new());
    };
    let text = std::fs::read_to_string(path)?;
    let fixtures: Fixtures = serde_yaml::from_str(&text).map_err(|e| {
        TripwireError::internal(format!("invalid fixtures {}: {e}", path.display()))
    })?;
    Ok(InMemoryStore::from_fixtures(fixtures)?)
}

fn run(args: &Args, cfg: Config) -> Result<(), TripwireError> {
    let store: Arc<dyn Store> = Arc::new(load_store(args.fixtures.as_ref())?);

    let shutdown = ShutdownSignal::new();
    let handler = shutdown.clone();
    ctrlc::set_handler(move || handler.trigger())
        .map_err(|e| TripwireError::internal(format!("failed to install signal handler: {e}")))?;

    let pipeline = PipelineBuilder::new(cfg, store)
        .shutdown_signal(shutdown.clone())
        .start()?;
    if let Some(addr) = pipeline.listen_addr() {
        tracing::info!(%addr, "accepting metrics");
    }

    while !shutdown.wait_timeout(REPORT_INTERVAL) {
        match serde_json::to_string(&pipeline.metrics().snapshot()) {
            Ok(snapshot) => tracing::info!(%snapshot, "counters"),
            Err(e) => tracing::debug!(error = %e, "failed to encode counters"),
        }
    }
    pipeline.shutdown()
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.default_config {
        return match serde_yaml::to_string(&Config::default()) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let cfg = match args.config.as_deref().map(config::load_from_file) {
        None => Config::default(),
        Some(Ok(cfg)) => cfg,
        Some(Err(e)) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&cfg.log);

    match run(&args, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "tripwire stopped with an error");
            ExitCode::FAILURE
        }
    }
}
