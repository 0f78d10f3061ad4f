//! drivesync - offline-first driving telemetry
//!
//! Records position captures into the local store, and inspects or maintains
//! what is waiting there. Uploading is done by `drivesync-sync`.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/drivesync/drivesync.db
//! - Tracker settings: $XDG_DATA_HOME/drivesync/tracker.toml
//! - Logs: $XDG_STATE_HOME/drivesync/drivesync.log
//! - Config: $XDG_CONFIG_HOME/drivesync/config.toml

mod track;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use drivesync_core::{Config, ConfigStore, EventType, LocalStore, Sensitivity, Table, TrackerConfig};

#[derive(Parser)]
#[command(name = "drivesync")]
#[command(about = "Offline-first driving telemetry tracker")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a JSON-lines sensor capture through detection into the local store
    Track {
        /// Capture file (one `{"kind": "position" | "motion", ...}` object per line)
        #[arg(short, long)]
        capture: PathBuf,

        /// Also print skipped readings and events with notifications off
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show stored and pending records
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show or change tracker settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },

    /// List events not yet delivered as notifications
    Events {
        /// Maximum number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Mark the listed events as notified
        #[arg(long)]
        ack: bool,
    },

    /// Delete all local events that are not part of an upload in progress
    ClearEvents,

    /// Delete records older than the retention windows
    Prune,
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings
    Show,

    /// Change one or more settings; the rest keep their current value
    Set {
        /// Speed limit in km/h (1-200)
        #[arg(long)]
        max_speed: Option<u32>,

        /// Seconds between samples (5-300)
        #[arg(long)]
        sample_interval: Option<u64>,

        /// low, medium or high
        #[arg(long)]
        sensitivity: Option<String>,

        #[arg(long)]
        notifications: Option<bool>,

        #[arg(long)]
        auto_start: Option<bool>,
    },

    /// Restore the defaults
    Reset,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        drivesync_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("drivesync starting");

    let tracker_config = Arc::new(
        ConfigStore::load(Config::tracker_config_path())
            .context("failed to load tracker settings")?,
    );

    match args.command {
        Command::Settings { action } => {
            run_settings(&tracker_config, action.unwrap_or(SettingsAction::Show))
        }
        command => {
            let db_path = Config::database_path();
            tracing::info!(path = %db_path.display(), "Opening local store");
            let store = LocalStore::open(&db_path).context("failed to open local store")?;
            store.migrate().context("failed to run database migrations")?;
            let store = Arc::new(store);

            match command {
                Command::Track { capture, verbose } => {
                    track::run(&capture, store, tracker_config, verbose)
                }
                Command::Status { json } => run_status(&store, &tracker_config, &config, json),
                Command::Events { limit, ack } => run_events(&store, limit, ack),
                Command::ClearEvents => {
                    let deleted = store.clear_events().context("failed to clear events")?;
                    println!("Cleared {} event(s)", deleted);
                    Ok(())
                }
                Command::Prune => run_prune(&store, &config),
                Command::Settings { .. } => unreachable!("handled above"),
            }
        }
    }
}

fn run_status(
    store: &LocalStore,
    tracker_config: &ConfigStore,
    config: &Config,
    json: bool,
) -> Result<()> {
    let positions = store.count(Table::Positions)?;
    let events = store.count(Table::Events)?;
    let pending = store.pending_counts()?;
    let counts = store.event_counts()?;
    let settings = tracker_config.current();

    if json {
        let by_type: serde_json::Map<String, serde_json::Value> = EventType::ALL
            .iter()
            .map(|t| (t.as_str().to_string(), counts.get(*t).into()))
            .collect();
        let status = serde_json::json!({
            "database": Config::database_path(),
            "positions": { "total": positions, "pending": pending.positions },
            "events": { "total": events, "pending": pending.events, "by_type": by_type },
            "settings": &*settings,
            "remote": config.remote.base_url,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Database: {}", Config::database_path().display());
    println!();
    println!("Positions:  {} stored, {} pending upload", positions, pending.positions);
    println!("Events:     {} stored, {} pending upload", events, pending.events);
    for event_type in EventType::ALL {
        println!("  {:<20} {}", event_type.title(), counts.get(event_type));
    }
    println!();
    println!(
        "Tracker:    limit {} km/h, every {} s, {} sensitivity, notifications {}",
        settings.max_speed,
        settings.sample_interval,
        settings.sensitivity.as_str(),
        if settings.notifications { "on" } else { "off" }
    );
    match &config.remote.base_url {
        Some(url) => println!("Remote:     {}", url),
        None => println!("Remote:     not configured"),
    }

    Ok(())
}

fn run_settings(store: &ConfigStore, action: SettingsAction) -> Result<()> {
    match action {
        SettingsAction::Show => {}
        SettingsAction::Set {
            max_speed,
            sample_interval,
            sensitivity,
            notifications,
            auto_start,
        } => {
            let current = store.current();
            let updated = TrackerConfig {
                max_speed: max_speed.unwrap_or(current.max_speed),
                sample_interval: sample_interval.unwrap_or(current.sample_interval),
                sensitivity: match sensitivity {
                    Some(s) => s.parse::<Sensitivity>()?,
                    None => current.sensitivity,
                },
                notifications: notifications.unwrap_or(current.notifications),
                auto_start: auto_start.unwrap_or(current.auto_start),
            };
            store.save(updated).context("settings rejected")?;
            println!("Settings saved to {}", store.path().display());
        }
        SettingsAction::Reset => {
            store
                .save(TrackerConfig::default())
                .context("failed to reset settings")?;
            println!("Settings reset to defaults");
        }
    }

    let rendered = toml::to_string_pretty(&*store.current())
        .context("failed to render settings")?;
    print!("{}", rendered);
    Ok(())
}

fn run_events(store: &LocalStore, limit: usize, ack: bool) -> Result<()> {
    let events = store.unnotified_events(limit)?;
    if events.is_empty() {
        println!("No pending notifications");
        return Ok(());
    }

    for stored in &events {
        let event = &stored.event;
        println!(
            "#{:<6} {} {:<20} {}",
            stored.id,
            event.event_time.format("%Y-%m-%d %H:%M:%S"),
            event.event_type.title(),
            event.description
        );
    }

    if ack {
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let marked = store.mark_notified(&ids)?;
        println!("\nMarked {} event(s) as notified", marked);
    }

    Ok(())
}

fn run_prune(store: &LocalStore, config: &Config) -> Result<()> {
    let now = Utc::now();
    let positions = store
        .prune_older_than(Table::Positions, now - config.retention.position_retention())
        .context("failed to prune positions")?;
    let events = store
        .prune_older_than(Table::Events, now - config.retention.event_retention())
        .context("failed to prune events")?;

    println!(
        "Pruned {} position(s) older than {} days and {} event(s) older than {} days",
        positions, config.retention.position_days, events, config.retention.event_days
    );
    tracing::info!(positions, events, "drivesync prune complete");
    Ok(())
}
