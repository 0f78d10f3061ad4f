//! Integration tests for the capture → detection → store → sync pipeline
//!
//! These tests replay `tests/fixtures/commute.jsonl` through the tracker into
//! an on-disk store and then drain it with the sync engine.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::FakeRemote;
use drivesync_core::sync::{CycleOutcome, SyncEngine, SyncSettings};
use drivesync_core::{
    ConfigStore, EventType, JsonlSource, LocalStore, PositionSampler, Sensitivity, Table,
    Tracker, TrackerConfig,
};
use tempfile::TempDir;

/// Get the path to a fixture file
fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn open_store(dir: &TempDir) -> Arc<LocalStore> {
    let store = LocalStore::open(&dir.path().join("drivesync.db")).unwrap();
    store.migrate().unwrap();
    Arc::new(store)
}

fn config_store(dir: &TempDir) -> Arc<ConfigStore> {
    Arc::new(ConfigStore::load(dir.path().join("tracker.toml")).unwrap())
}

/// Keep everything: the fixture is older than the default retention windows.
fn keep_forever() -> SyncSettings {
    SyncSettings {
        position_retention: chrono::Duration::days(36500),
        event_retention: chrono::Duration::days(36500),
        ..SyncSettings::default()
    }
}

fn replay(tracker: &mut Tracker) -> drivesync_core::TrackerStats {
    let source = JsonlSource::open(&fixture_path("commute.jsonl")).unwrap();
    let mut sampler = PositionSampler::new(source);
    tracker.run(&mut sampler).unwrap()
}

// ============================================
// Tracking
// ============================================

#[test]
fn test_replay_detects_expected_events() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut tracker = Tracker::new(store.clone(), config_store(&dir));

    let stats = replay(&mut tracker);

    // One malformed line, one out-of-range latitude
    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.positions, 5);
    assert_eq!(stats.motion_readings, 1);

    assert_eq!(stats.events.speeding, 3);
    assert_eq!(stats.events.harsh_acceleration, 1);
    assert_eq!(stats.events.harsh_braking, 1);
    assert_eq!(stats.events.crash, 1);

    assert_eq!(store.count(Table::Positions).unwrap(), 5);
    assert_eq!(store.event_counts().unwrap(), stats.events);
}

#[test]
fn test_events_are_stored_in_detection_order() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut tracker = Tracker::new(store.clone(), config_store(&dir));
    replay(&mut tracker);

    let events = store.unsynced_events(100).unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::Speeding,
            EventType::HarshAcceleration,
            EventType::Speeding,
            EventType::Speeding,
            EventType::Crash,
            EventType::HarshBraking,
        ]
    );

    // Braking is measured against the last stored sample, not the rejected one
    let braking = &events[5].event;
    let expected = (124.0 - 40.0) / 3.6 / 4.0;
    assert!((braking.acceleration.unwrap() - expected).abs() < 1e-9);

    for window in events.windows(2) {
        assert!(window[0].id < window[1].id);
    }
}

#[test]
fn test_settings_change_applies_to_next_sample() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let config = config_store(&dir);

    config
        .save(TrackerConfig {
            max_speed: 140,
            sensitivity: Sensitivity::High,
            ..Default::default()
        })
        .unwrap();

    let mut tracker = Tracker::new(store.clone(), config.clone());
    let stats = replay(&mut tracker);

    assert_eq!(stats.events.speeding, 0);
    // 11.1 m/s² still exceeds the high threshold of 8
    assert_eq!(stats.events.harsh_acceleration, 1);
    // 5.83 m/s² does not
    assert_eq!(stats.events.harsh_braking, 0);
}

#[test]
fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        let mut tracker = Tracker::new(store, config_store(&dir));
        replay(&mut tracker);
    }

    let store = open_store(&dir);
    let pending = store.pending_counts().unwrap();
    assert_eq!(pending.positions, 5);
    assert_eq!(pending.events, 6);

    let first = &store.unsynced_positions(1).unwrap()[0];
    assert_eq!(first.sample.speed, 50.0);
    assert_eq!(first.sample.accuracy, Some(5.0));
    assert_eq!(first.sample.device_info["platform"], "linux");
}

// ============================================
// Tracking + sync
// ============================================

#[tokio::test]
async fn test_tracked_records_sync_exactly_once() {
    let dir = TempDir::new().unwrap();
    let tracker_store = open_store(&dir);
    let mut tracker = Tracker::new(tracker_store, config_store(&dir));
    replay(&mut tracker);

    // Separate handle on the same file, as in the CLI
    let sync_store = open_store(&dir);
    let remote = Arc::new(FakeRemote::new());
    let engine = SyncEngine::new(sync_store.clone(), remote.clone(), keep_forever()).unwrap();

    match engine.run_cycle().await {
        CycleOutcome::Completed(report) => {
            assert_eq!(report.positions.sent, 5);
            assert_eq!(report.events.sent, 6);
            assert_eq!(report.pruned_positions, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // More tracking after the cycle only sends the new rows
    tracker.reset();
    replay(&mut tracker);
    match engine.run_cycle().await {
        CycleOutcome::Completed(report) => {
            assert_eq!(report.positions.sent, 5);
            assert_eq!(report.events.sent, 6);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let mut sent: Vec<String> = remote
        .position_batches
        .lock()
        .unwrap()
        .iter()
        .flatten()
        .cloned()
        .collect();
    let total = sent.len();
    sent.sort();
    sent.dedup();
    assert_eq!(sent.len(), total, "no position was sent twice");
    assert_eq!(total, 10);

    let pending = sync_store.pending_counts().unwrap();
    assert_eq!(pending.positions, 0);
    assert_eq!(pending.events, 0);
}

#[tokio::test]
async fn test_default_retention_prunes_fixture_after_sync() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let mut tracker = Tracker::new(store.clone(), config_store(&dir));
    replay(&mut tracker);

    let remote = Arc::new(FakeRemote::new());
    let engine = SyncEngine::new(store.clone(), remote.clone(), SyncSettings::default()).unwrap();

    match engine.run_cycle().await {
        CycleOutcome::Completed(report) => {
            // Sent first, then pruned as older than 7 / 30 days
            assert_eq!(report.positions.sent, 5);
            assert_eq!(report.pruned_positions, 5);
            assert_eq!(report.pruned_events, 6);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(store.count(Table::Positions).unwrap(), 0);
}
