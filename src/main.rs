//! runfeed CLI - Live test result reporting.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use runfeed::config::{self, Config, TrackerConfig};
use runfeed::events;
use runfeed::report;
use runfeed::result::RunComplete;
use runfeed::run::{RunId, RunRequest, open_run};
use runfeed::session::ReportingSession;
use runfeed::tracker::RunTracker;
use runfeed::tracker::memory::MemoryTracker;
use runfeed::tracker::shell::ShellTracker;

const DEFAULT_CONFIG: &str = "runfeed.toml";

#[derive(Parser)]
#[command(name = "runfeed")]
#[command(about = "Report test results to a tracking service while tests run", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read host events and report them
    Ingest {
        /// JSON-lines event file, or "-" for stdin
        #[arg(short, long, default_value = "-")]
        events: PathBuf,

        /// Report into this existing run
        #[arg(long)]
        run_id: Option<i64>,

        /// Reuse the run recorded in the checkpoint file
        #[arg(long)]
        rerun: bool,

        /// Log tracker calls instead of making them
        #[arg(long)]
        dry_run: bool,
    },

    /// Create a run, record it in the checkpoint file and print its id
    CreateRun {
        #[arg(long)]
        dry_run: bool,
    },

    /// Mark a run completed
    CompleteRun {
        #[arg(long)]
        run_id: i64,

        /// Mark the run aborted instead
        #[arg(long)]
        aborted: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; stdout is reserved for command output.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Ingest {
            events,
            run_id,
            rerun,
            dry_run,
        } => ingest(&cli.config, &events, run_id, rerun, dry_run).await,
        Commands::CreateRun { dry_run } => create_run(&cli.config, dry_run).await,
        Commands::CompleteRun {
            run_id,
            aborted,
            dry_run,
        } => complete_run(&cli.config, run_id, aborted, dry_run).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

/// Loads and validates configuration, then overlays the CI environment.
///
/// A missing default config file means "all defaults"; a missing file that
/// was asked for explicitly is an error.
fn load(config_path: &Path) -> Result<Config> {
    let mut config = if !config_path.exists() && config_path == Path::new(DEFAULT_CONFIG) {
        info!("No {} found, using defaults", DEFAULT_CONFIG);
        Config::default()
    } else {
        let config = config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
        info!("Loaded configuration from {}", config_path.display());
        config
    };

    config.validate()?;
    config.run.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

fn build_tracker(config: &Config, dry_run: bool) -> Arc<dyn RunTracker> {
    if dry_run {
        info!("Dry run: tracker calls are logged, not sent");
        return Arc::new(MemoryTracker::logging());
    }

    match &config.tracker {
        TrackerConfig::Shell {
            command,
            working_dir,
            timeout_secs,
        } => {
            let mut tracker = ShellTracker::new(command.as_str()).with_timeout(*timeout_secs);
            if let Some(dir) = working_dir {
                let dir = shellexpand::tilde(&dir.to_string_lossy()).into_owned();
                tracker = tracker.with_working_dir(PathBuf::from(dir));
            }
            Arc::new(tracker)
        }
        TrackerConfig::Log => Arc::new(MemoryTracker::logging()),
    }
}

async fn ingest(
    config_path: &Path,
    events_path: &Path,
    run_id: Option<i64>,
    rerun: bool,
    dry_run: bool,
) -> Result<()> {
    let config = load(config_path)?;
    let tracker = build_tracker(&config, dry_run);

    let request = config.run.run_request(run_id.map(RunId), rerun);
    let run = open_run(
        tracker.as_ref(),
        config.run_metadata(),
        &request,
        &config.checkpoint(),
    )
    .await?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if events_path == Path::new("-") {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(events_path)
            .await
            .with_context(|| format!("Failed to open events file {}", events_path.display()))?;
        Box::new(BufReader::new(file))
    };

    let session = ReportingSession::start(tracker, run, config.session_options());
    let completion = match events::pump(reader, &session.sink()).await {
        Ok(summary) => {
            if summary.skipped_lines > 0 {
                warn!("Skipped {} malformed event line(s)", summary.skipped_lines);
            }
            summary.completion
        }
        Err(e) => {
            // Whatever was read is still reported; the run counts as aborted.
            warn!("Failed to read events: {}", e);
            RunComplete::aborted()
        }
    };

    match session.flush(completion).await {
        Ok(flushed) => {
            report::print_summary(&flushed);
            if flushed.stats.dropped > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            report::print_failure(&e);
            std::process::exit(1);
        }
    }
}

async fn create_run(config_path: &Path, dry_run: bool) -> Result<()> {
    let config = load(config_path)?;
    let tracker = build_tracker(&config, dry_run);

    // Explicitly create: never attach to a checkpointed run here.
    let request: RunRequest = config.run.run_request(None, false);
    let checkpoint = config.checkpoint();
    let run = open_run(tracker.as_ref(), config.run_metadata(), &request, &checkpoint).await?;

    info!("Run id written to {}", checkpoint.path().display());
    println!("{}", run.id);
    Ok(())
}

async fn complete_run(config_path: &Path, run_id: i64, aborted: bool, dry_run: bool) -> Result<()> {
    let config = load(config_path)?;
    let tracker = build_tracker(&config, dry_run);
    let limit = Duration::from_secs(config.session.finalize_timeout_secs);

    tokio::time::timeout(limit, tracker.complete_run(RunId(run_id), aborted, Utc::now()))
        .await
        .with_context(|| format!("Completing run {} timed out after {:?}", run_id, limit))?
        .with_context(|| format!("Failed to complete run {}", run_id))?;

    let state = if aborted { "aborted" } else { "completed" };
    println!("Run {} marked {}", run_id, state);
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path).and_then(|config| {
        config.validate()?;
        Ok(config)
    });

    match config {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Drain timeout: {}s", config.session.drain_timeout_secs);
            println!("  Finalize timeout: {}s", config.session.finalize_timeout_secs);
            println!("  Abort timeout: {}s", config.session.abort_timeout_secs);
            println!("  Max deferrals: {}", config.session.max_deferrals);
            println!("  Group by class: {}", config.grouping.group_by_class);
            if let Some(source) = &config.grouping.source {
                println!("  Source: {}", source);
            }
            println!("  Checkpoint: {}", config.run.checkpoint.display());

            let tracker_name = match &config.tracker {
                TrackerConfig::Shell { .. } => "shell",
                TrackerConfig::Log => "log",
            };
            println!("  Tracker: {}", tracker_name);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            config_path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(config_path, config::EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created {}", config_path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  runfeed ingest --events results.jsonl");

    Ok(())
}
