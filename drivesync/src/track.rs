//! `drivesync track`: replay a sensor capture through the tracker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use drivesync_core::{
    BehaviorEvent, ConfigStore, Error, JsonlSource, LocalStore, PositionSample, PositionSampler,
    Tracker, TrackerObserver, TrackerStats,
};
use indicatif::{ProgressBar, ProgressStyle};

/// Prints detected events above a spinner.
struct CliObserver {
    pb: ProgressBar,
    verbose: bool,
}

impl TrackerObserver for CliObserver {
    fn on_position(&self, _id: i64, _sample: &PositionSample) {
        self.pb.inc(1);
    }

    fn on_event(&self, id: i64, event: &BehaviorEvent, notify: bool) {
        if !notify && !self.verbose {
            return;
        }
        let marker = if event.event_type.requires_interaction() {
            "!!"
        } else {
            "  "
        };
        self.print(format!(
            "{} [{}] {}: {} (#{})",
            marker,
            event.event_time.format("%H:%M:%S"),
            event.event_type.title(),
            event.description,
            id
        ));
    }

    fn on_error(&self, error: &Error) {
        if self.verbose {
            self.print(format!("   skipped: {}", error));
        }
    }
}

impl CliObserver {
    // A hidden bar (output not a terminal) swallows println
    fn print(&self, line: String) {
        if self.pb.is_hidden() {
            println!("{}", line);
        } else {
            self.pb.println(line);
        }
    }
}

pub fn run(
    capture: &Path,
    store: Arc<LocalStore>,
    config: Arc<ConfigStore>,
    verbose: bool,
) -> Result<()> {
    let source = JsonlSource::open(capture)
        .with_context(|| format!("failed to open capture {}", capture.display()))?;
    let mut sampler = PositionSampler::new(source);

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {pos} samples {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let observer = CliObserver {
        pb: pb.clone(),
        verbose,
    };
    let mut tracker = Tracker::new(store, config).with_observer(Box::new(observer));

    tracing::info!(capture = %capture.display(), "Replaying capture");
    let stats = tracker.run(&mut sampler).context("tracking failed")?;

    pb.finish_and_clear();
    print_stats(&stats);

    tracing::info!(
        positions = stats.positions,
        events = stats.events.total(),
        rejected = stats.rejected,
        "drivesync track complete"
    );

    Ok(())
}

fn print_stats(stats: &TrackerStats) {
    println!("\nTracking complete:");
    println!("  Positions stored:   {}", stats.positions);
    println!("  Motion readings:    {}", stats.motion_readings);
    println!("  Readings rejected:  {}", stats.rejected);
    println!("  Events detected:    {}", stats.events.total());
    for event_type in drivesync_core::EventType::ALL {
        let count = stats.events.get(event_type);
        if count > 0 {
            println!("    {:<20} {}", event_type.title(), count);
        }
    }
}
