//! invsync CLI
//!
//! Command-line trigger surface for the inventory sync engine.
//!
//! # Commands
//!
//! - `run` - Run one sync with a strategy
//! - `status` - Show who holds the sync lock
//! - `history` - List recent runs
//! - `health` - Show last success and consecutive failures
//! - `redrive` - Re-run the failed keys of an earlier run
//! - `schedule` - Run syncs on an interval until interrupted
//!
//! The API token is read from `INVSYNC_API_TOKEN` and the base URL may be
//! overridden with `INVSYNC_BASE_URL`. Output is JSON on stdout; logs go to
//! stderr and follow `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use invsync::remote::HttpSource;
use invsync::store::SqliteStore;
use invsync::{EngineConfig, RunId, RunOptions, Scheduler, SyncEngine, SyncRun, SyncStrategy};

const TOKEN_VAR: &str = "INVSYNC_API_TOKEN";
const BASE_URL_VAR: &str = "INVSYNC_BASE_URL";

/// Inventory sync engine.
#[derive(Parser)]
#[command(name = "invsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Path to the SQLite database
    #[arg(global = true, long, default_value = "invsync.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync
    Run {
        /// full, incremental, inventory_only, critical_only or smart
        #[arg(short, long, default_value = "smart")]
        strategy: SyncStrategy,

        /// Compute changes without writing them
        #[arg(long)]
        dry_run: bool,

        /// Abort the run after this many milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },

    /// Show the current lock holder
    Status,

    /// List recent runs, newest first
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show sync health
    Health,

    /// Re-run the keys that failed in an earlier run
    Redrive {
        run_id: RunId,

        #[arg(long)]
        dry_run: bool,
    },

    /// Run syncs on an interval until interrupted
    Schedule {
        /// Override the configured interval, in seconds
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Override the configured strategy
        #[arg(short, long)]
        strategy: Option<SyncStrategy>,
    },
}

#[derive(Serialize)]
struct RunSummary<'a> {
    id: String,
    status: &'a str,
    tier: Option<&'a str>,
    dry_run: bool,
    duration_ms: Option<i64>,
    counts: &'a invsync::core::RunCounts,
    failures: usize,
    listing_failures: usize,
    error: Option<&'a str>,
}

impl<'a> From<&'a SyncRun> for RunSummary<'a> {
    fn from(run: &'a SyncRun) -> Self {
        Self {
            id: run.id.to_string(),
            status: run.status.as_str(),
            tier: run.tier.map(|t| t.as_str()),
            dry_run: run.dry_run,
            duration_ms: run.duration_ms(),
            counts: &run.counts,
            failures: run.failures.len(),
            listing_failures: run.listing_failures.len(),
            error: run.error.as_deref(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    invsync::logging::init_tracing();
    let cli = Cli::parse();
    let engine = build_engine(&cli)?;

    match cli.command {
        Commands::Run {
            strategy,
            dry_run,
            deadline_ms,
        } => {
            let mut options = RunOptions {
                dry_run,
                ..RunOptions::default()
            };
            if let Some(ms) = deadline_ms {
                options = options.with_deadline(Duration::from_millis(ms));
            }
            let run = engine
                .run_sync(strategy, options.with_cancel(interrupt_token()))
                .await;
            print_json(&run)?;
            exit_for(&run);
        }
        Commands::Status => {
            let lock = engine.current_lock().await?;
            print_json(&lock)?;
        }
        Commands::History { limit } => {
            let runs = engine.history(limit).await?;
            let summaries: Vec<RunSummary<'_>> = runs.iter().map(RunSummary::from).collect();
            print_json(&summaries)?;
        }
        Commands::Health => {
            let health = engine.health().await?;
            print_json(&health)?;
        }
        Commands::Redrive { run_id, dry_run } => {
            let options = RunOptions {
                dry_run,
                ..RunOptions::default()
            };
            let run = engine
                .redrive(run_id, options.with_cancel(interrupt_token()))
                .await?;
            print_json(&run)?;
            exit_for(&run);
        }
        Commands::Schedule {
            interval_secs,
            strategy,
        } => {
            let mut scheduler = Scheduler::new(engine);
            if let Some(secs) = interval_secs {
                scheduler = scheduler.with_interval(Duration::from_secs(secs));
            }
            if let Some(strategy) = strategy {
                scheduler = scheduler.with_strategy(strategy);
            }
            let runs = scheduler.run(interrupt_token()).await;
            info!(runs, "scheduler stopped");
        }
    }

    Ok(())
}

fn build_engine(cli: &Cli) -> anyhow::Result<SyncEngine> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Ok(token) = std::env::var(TOKEN_VAR) {
        config.http.api_token = Some(token);
    }
    if let Ok(url) = std::env::var(BASE_URL_VAR) {
        config.http.base_url = url;
    }

    let store = SqliteStore::open(&cli.db)
        .with_context(|| format!("opening database {}", cli.db.display()))?;
    let source = HttpSource::new(&config.http).context("building HTTP client")?;
    let engine = SyncEngine::new(Arc::new(store), Arc::new(source), config)?;
    Ok(engine)
}

/// A token cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted; stopping");
            trigger.cancel();
        }
    });
    cancel
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Failed, aborted and stuck runs exit non-zero.
fn exit_for(run: &SyncRun) {
    if run.status.is_failure() {
        std::process::exit(1);
    }
}
