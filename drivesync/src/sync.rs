//! drivesync-sync - upload locally stored telemetry to the fleet API
//!
//! Drains unsynced positions and events from the local store in batches,
//! marks what the server acknowledged, and prunes records past their
//! retention window. In watch mode, cycles also run whenever the remote
//! host becomes reachable again.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/drivesync/drivesync.db
//! - Logs: $XDG_STATE_HOME/drivesync/drivesync.log
//! - Config: $XDG_CONFIG_HOME/drivesync/config.toml

mod process_lock;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use drivesync_core::sync::{SyncReport, SyncSettings, TableReport};
use drivesync_core::{
    Config, CycleOutcome, HttpRemoteApi, LocalStore, SyncEngine, SyncScheduler,
};
use process_lock::acquire_sync_guard;

#[derive(Parser)]
#[command(name = "drivesync-sync")]
#[command(about = "Upload stored positions and events to the fleet API")]
#[command(version)]
struct Args {
    /// Verbose output (-v shows per-table batch details)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Dry run - show what is pending but don't upload
    #[arg(long)]
    dry_run: bool,

    /// Watch mode - keep syncing on an interval instead of one-shot
    #[arg(short, long)]
    watch: bool,

    /// Seconds between cycles (only with --watch, defaults to sync.interval_secs)
    #[arg(long)]
    interval: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        drivesync_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("drivesync-sync starting");

    // Starting an engine releases every claim, so only one owner per database
    let db_path = Config::database_path();
    let _sync_guard = acquire_sync_guard(&db_path).context("failed to acquire process lock")?;

    tracing::info!(path = %db_path.display(), "Opening local store");
    let store = LocalStore::open(&db_path).context("failed to open local store")?;
    store.migrate().context("failed to run database migrations")?;
    let store = Arc::new(store);

    println!("Database: {}", db_path.display());

    let pending = store.pending_counts()?;
    println!(
        "Pending: {} position(s), {} event(s)",
        pending.positions, pending.events
    );

    if args.dry_run {
        println!("\nDry run - no upload performed");
        tracing::info!("Dry run complete");
        return Ok(());
    }

    if !config.remote.is_ready() {
        anyhow::bail!(
            "no remote configured: set remote.base_url in {}",
            Config::config_path().display()
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let remote = {
        let _rt = runtime.enter();
        HttpRemoteApi::new(&config.remote).context("failed to create API client")?
    };
    println!("Remote: {}", remote.base_url());
    let remote_url = remote.base_url().to_string();

    let engine = Arc::new(
        SyncEngine::new(store, Arc::new(remote), SyncSettings::from_config(&config))
            .context("failed to start sync engine")?,
    );

    if args.watch {
        let interval = args.interval.unwrap_or(config.sync.interval_secs).max(1);
        let reachability = Reachability {
            base_url: remote_url,
            every: Duration::from_secs(config.sync.reachability_secs),
            timeout: Duration::from_secs(config.remote.timeout_secs),
        };
        run_watch_mode(&runtime, engine, Duration::from_secs(interval), reachability)
    } else {
        run_single_sync(&runtime, &engine, args.verbose)
    }
}

/// Run one cycle and report it
fn run_single_sync(
    runtime: &tokio::runtime::Runtime,
    engine: &SyncEngine,
    verbose: u8,
) -> Result<()> {
    match runtime.block_on(engine.run_cycle()) {
        CycleOutcome::Completed(report) => {
            print_report(&report, verbose);
            tracing::info!(
                positions_sent = report.positions.sent,
                events_sent = report.events.sent,
                pruned_positions = report.pruned_positions,
                pruned_events = report.pruned_events,
                "drivesync-sync complete"
            );
            if report.is_clean() {
                Ok(())
            } else {
                anyhow::bail!("sync incomplete, unsent records stay queued for the next run")
            }
        }
        // Neither can happen with a fresh engine that owns the process lock
        other => anyhow::bail!("sync did not run: {:?}", other),
    }
}

/// How watch mode checks whether the remote can be reached
struct Reachability {
    base_url: String,
    every: Duration,
    timeout: Duration,
}

/// Run the scheduler until Ctrl+C
fn run_watch_mode(
    runtime: &tokio::runtime::Runtime,
    engine: Arc<SyncEngine>,
    interval: Duration,
    reachability: Reachability,
) -> Result<()> {
    let scheduler = SyncScheduler::new(engine.clone(), interval);
    let shutdown = scheduler.shutdown_handle();

    let monitor = runtime.spawn(scheduler.connectivity().follow_reachability(
        reachability.base_url,
        reachability.every,
        reachability.timeout,
    ));

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        shutdown.shutdown();
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Watch mode active (sync every {}s, reachability check every {}s). Press Ctrl+C to stop.",
        interval.as_secs(),
        reachability.every.as_secs()
    );
    println!();

    let cycles = runtime.block_on(scheduler.run());
    monitor.abort();
    let stats = engine.stats();

    println!("Watch mode stopped.");
    println!("  Cycles:         {}", cycles);
    println!("  Positions sent: {}", stats.positions_sent);
    println!("  Events sent:    {}", stats.events_sent);
    println!("  Failed batches: {}", stats.failed_batches);
    if let Some(error) = &stats.last_error {
        println!("  Last error:     {}", error);
    }

    tracing::info!(
        cycles,
        positions_sent = stats.positions_sent,
        events_sent = stats.events_sent,
        "drivesync-sync watch mode stopped"
    );
    Ok(())
}

fn print_report(report: &SyncReport, verbose: u8) {
    println!("\nSync complete:");
    println!("  Positions sent:   {}", report.positions.sent);
    println!("  Events sent:      {}", report.events.sent);
    println!("  Positions pruned: {}", report.pruned_positions);
    println!("  Events pruned:    {}", report.pruned_events);
    println!("  Duration:         {:.2?}", report.duration);

    if verbose >= 1 {
        print_table("Positions", &report.positions);
        print_table("Events", &report.events);
    }

    for (name, table) in [("positions", &report.positions), ("events", &report.events)] {
        if let Some(error) = &table.last_error {
            println!("\nError ({}): {}", name, error);
        }
    }
}

fn print_table(name: &str, table: &TableReport) {
    println!(
        "\n{}: {} batch(es) acknowledged, {} failed, batch size halved {} time(s)",
        name, table.batches, table.failures, table.halvings
    );
}
