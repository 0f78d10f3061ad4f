//! Sequential ingestion path
//!
//! [`Tracker`] glues the sampler, the detector and the local store together:
//! each position sample is validated, classified, and persisted with the
//! events it produced in one transaction. The detector's notion of "previous
//! sample" only advances after that commit, so a failed write can be retried
//! with the same reading and yields the same events.

use std::sync::Arc;

use crate::config_store::ConfigStore;
use crate::db::LocalStore;
use crate::detector::DetectorState;
use crate::error::{Error, Result};
use crate::sampler::{PositionSampler, SensorSource};
use crate::types::{BehaviorEvent, EventCounts, PositionSample, SensorReading};

/// Callbacks for whatever presents tracking activity (CLI output, a UI).
///
/// All methods default to no-ops.
pub trait TrackerObserver: Send + Sync {
    /// A sample was persisted.
    fn on_position(&self, _id: i64, _sample: &PositionSample) {}

    /// An event was persisted. `notify` reflects the current notification setting.
    fn on_event(&self, _id: i64, _event: &BehaviorEvent, _notify: bool) {}

    /// A reading was rejected or could not be stored.
    fn on_error(&self, _error: &Error) {}
}

/// Counters for the current tracking session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub positions: u64,
    pub motion_readings: u64,
    /// Readings skipped because they were malformed or invalid
    pub rejected: u64,
    pub events: EventCounts,
}

/// What [`Tracker::ingest`] did with one reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Motion {
        magnitude: f64,
    },
    Position {
        position_id: i64,
        event_ids: Vec<i64>,
        events: Vec<BehaviorEvent>,
    },
}

pub struct Tracker {
    store: Arc<LocalStore>,
    config: Arc<ConfigStore>,
    state: DetectorState,
    observer: Option<Box<dyn TrackerObserver>>,
    stats: TrackerStats,
    /// Reading whose store write failed, retried before the sampler advances
    pending: Option<SensorReading>,
}

impl Tracker {
    pub fn new(store: Arc<LocalStore>, config: Arc<ConfigStore>) -> Self {
        Self {
            store,
            config,
            state: DetectorState::new(),
            observer: None,
            stats: TrackerStats::default(),
            pending: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn TrackerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Process one reading.
    ///
    /// Invalid samples return [`Error::Validation`] and are not stored. A
    /// storage failure returns [`Error::Storage`] with nothing written and
    /// detector state unchanged; the caller may retry the same reading.
    pub fn ingest(&mut self, reading: SensorReading) -> Result<Ingested> {
        match reading {
            SensorReading::Motion(motion) => {
                let magnitude = motion.magnitude();
                self.state.observe_motion(magnitude);
                self.stats.motion_readings += 1;
                Ok(Ingested::Motion { magnitude })
            }
            SensorReading::Position(sample) => self.ingest_position(sample),
        }
    }

    fn ingest_position(&mut self, sample: PositionSample) -> Result<Ingested> {
        if let Err(e) = sample.validate() {
            self.stats.rejected += 1;
            self.notify_error(&e);
            return Err(e);
        }

        let config = self.config.current();
        let events = self.state.evaluate(&sample, &config);

        let appended = match self.store.append_observation(&sample, &events) {
            Ok(appended) => appended,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to persist sample");
                self.notify_error(&e);
                return Err(e);
            }
        };

        self.stats.positions += 1;
        for event in &events {
            self.stats.events.increment(event.event_type, 1);
            tracing::info!(
                event_type = %event.event_type,
                speed = ?event.speed,
                description = %event.description,
                "Behavior event detected"
            );
        }

        if let Some(observer) = &self.observer {
            observer.on_position(appended.position_id, &sample);
            for (id, event) in appended.event_ids.iter().zip(&events) {
                observer.on_event(*id, event, config.notifications);
            }
        }

        self.state.commit(sample);

        Ok(Ingested::Position {
            position_id: appended.position_id,
            event_ids: appended.event_ids,
            events,
        })
    }

    /// Drain a sampler until it runs dry.
    ///
    /// Malformed and invalid readings are logged and skipped. A storage
    /// failure stops the run and keeps the reading; the next call to `run`
    /// stores it before pulling anything new from the sampler.
    pub fn run<S: SensorSource>(&mut self, sampler: &mut PositionSampler<S>) -> Result<TrackerStats> {
        loop {
            let reading = match self.pending.take() {
                Some(reading) => reading,
                None => match sampler.next() {
                    None => break,
                    Some(Ok(reading)) => reading,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Skipping unreadable sensor input");
                        self.stats.rejected += 1;
                        self.notify_error(&e);
                        continue;
                    }
                },
            };

            match self.ingest(reading.clone()) {
                Ok(_) => {}
                Err(e @ Error::Validation { .. }) => {
                    tracing::warn!(error = %e, "Skipping invalid sample");
                }
                Err(e) => {
                    self.pending = Some(reading);
                    return Err(e);
                }
            }
        }

        tracing::info!(
            positions = self.stats.positions,
            events = self.stats.events.total(),
            rejected = self.stats.rejected,
            "Sampler drained"
        );

        Ok(self.stats.clone())
    }

    /// The reading a failed [`Tracker::run`] will retry first, if any.
    pub fn pending(&self) -> Option<&SensorReading> {
        self.pending.as_ref()
    }

    /// Forget the previous sample and motion magnitude, as when tracking is
    /// stopped and started again.
    pub fn reset(&mut self) {
        self.state.reset();
    }

    pub fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    pub fn detector(&self) -> &DetectorState {
        &self.state
    }

    fn notify_error(&self, error: &Error) {
        if let Some(observer) = &self.observer {
            observer.on_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ReplaySource;
    use crate::types::{EventType, MotionReading, Table};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 29, 10, 0, 0).unwrap()
    }

    fn position(secs: i64, speed: f64) -> SensorReading {
        SensorReading::Position(PositionSample::new(
            t0() + Duration::seconds(secs),
            40.0,
            -3.0,
            speed,
        ))
    }

    fn tracker() -> (Tracker, Arc<LocalStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        store.migrate().unwrap();
        let config = Arc::new(ConfigStore::load(dir.path().join("tracker.toml")).unwrap());
        (Tracker::new(store.clone(), config), store, dir)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(EventType, bool)>>,
        errors: Mutex<usize>,
    }

    impl TrackerObserver for Arc<Recorder> {
        fn on_event(&self, _id: i64, event: &BehaviorEvent, notify: bool) {
            self.events.lock().unwrap().push((event.event_type, notify));
        }

        fn on_error(&self, _error: &Error) {
            *self.errors.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_ingest_persists_sample_and_events() {
        let (mut tracker, store, _dir) = tracker();

        tracker.ingest(position(0, 50.0)).unwrap();
        let result = tracker.ingest(position(2, 130.0)).unwrap();

        match result {
            Ingested::Position { events, event_ids, .. } => {
                assert_eq!(events.len(), 2);
                assert_eq!(event_ids.len(), 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(store.count(Table::Positions).unwrap(), 2);
        assert_eq!(store.count(Table::Events).unwrap(), 2);
        assert_eq!(tracker.stats().events.speeding, 1);
        assert_eq!(tracker.stats().events.harsh_acceleration, 1);
    }

    #[test]
    fn test_invalid_sample_is_not_stored_and_state_unchanged() {
        let (mut tracker, store, _dir) = tracker();
        tracker.ingest(position(0, 50.0)).unwrap();

        let bad = SensorReading::Position(PositionSample::new(t0(), 120.0, 0.0, 10.0));
        assert!(matches!(tracker.ingest(bad), Err(Error::Validation { .. })));

        assert_eq!(store.count(Table::Positions).unwrap(), 1);
        assert_eq!(tracker.detector().previous().unwrap().speed, 50.0);
        assert_eq!(tracker.stats().rejected, 1);
    }

    #[test]
    fn test_motion_feeds_crash_rule() {
        let (mut tracker, _store, _dir) = tracker();
        tracker.ingest(position(0, 40.0)).unwrap();
        tracker
            .ingest(SensorReading::Motion(MotionReading {
                x: 0.0,
                y: 0.0,
                z: 9.8,
            }))
            .unwrap();

        match tracker.ingest(position(2, 40.0)).unwrap() {
            Ingested::Position { events, .. } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].event_type, EventType::Crash);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_run_skips_bad_readings_and_notifies_observer() {
        let (tracker, _store, _dir) = tracker();
        let recorder = Arc::new(Recorder::default());
        let mut tracker = tracker.with_observer(Box::new(recorder.clone()));

        let bad = SensorReading::Position(PositionSample::new(t0(), 0.0, 0.0, -5.0));
        let mut sampler = PositionSampler::new(ReplaySource::new(vec![
            position(0, 50.0),
            bad,
            position(2, 130.0),
        ]));

        let stats = tracker.run(&mut sampler).unwrap();
        assert_eq!(stats.positions, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(*recorder.errors.lock().unwrap(), 1);

        let events = recorder.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                (EventType::Speeding, true),
                (EventType::HarshAcceleration, true)
            ]
        );
    }

    #[test]
    fn test_reset_forgets_previous_sample() {
        let (mut tracker, _store, _dir) = tracker();
        tracker.ingest(position(0, 50.0)).unwrap();
        tracker.reset();

        // Without a previous sample only speeding can fire
        match tracker.ingest(position(2, 130.0)).unwrap() {
            Ingested::Position { events, .. } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].event_type, EventType::Speeding);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_run_keeps_reading_after_storage_failure() {
        let dir = tempfile::tempdir().unwrap();
        // Not migrated yet: every append fails
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let config = Arc::new(ConfigStore::load(dir.path().join("tracker.toml")).unwrap());
        let mut tracker = Tracker::new(store.clone(), config);

        let mut sampler = PositionSampler::new(ReplaySource::new(vec![
            position(0, 50.0),
            position(2, 52.0),
            position(4, 54.0),
        ]));

        let err = tracker.run(&mut sampler).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(tracker.pending(), Some(&position(0, 50.0)));
        assert!(tracker.detector().previous().is_none());

        store.migrate().unwrap();
        let stats = tracker.run(&mut sampler).unwrap();

        assert_eq!(stats.positions, 3);
        assert_eq!(stats.rejected, 0);
        assert!(tracker.pending().is_none());

        let speeds: Vec<f64> = store
            .unsynced_positions(10)
            .unwrap()
            .iter()
            .map(|p| p.sample.speed)
            .collect();
        assert_eq!(speeds, vec![50.0, 52.0, 54.0]);
    }
}
