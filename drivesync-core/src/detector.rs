//! Driving-behavior detection
//!
//! [`detect`] classifies one position sample against the previous one and the
//! current [`TrackerConfig`]. It is a pure function: the device-motion
//! magnitude that the crash rule needs is passed in explicitly rather than
//! kept in hidden state.
//!
//! Rules are evaluated independently, so one sample may yield several events:
//!
//! | Rule | Condition | Event |
//! |------|-----------|-------|
//! | Speeding | `speed > max_speed` | `speeding` |
//! | Harsh accel/brake | `|Δspeed| / elapsed > threshold(sensitivity)` | `harsh_acceleration` / `harsh_braking` |
//! | Crash | `|last_magnitude - speed| / elapsed > 15`, magnitude non-zero | `crash` |
//!
//! The crash rule compares a device acceleration magnitude with a GPS speed
//! without reconciling units. That comparison is kept as-is until product
//! defines the intended formula.

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::types::{BehaviorEvent, EventType, MotionReading, PositionSample, TrackerConfig};

/// km/h → m/s
pub const KMH_TO_MS: f64 = 1.0 / 3.6;

/// Crash threshold for the magnitude/speed delta.
pub const CRASH_THRESHOLD: f64 = 15.0;

/// Classify `current` into zero or more behavior events.
///
/// `previous` is the last sample that was successfully persisted;
/// `last_magnitude` is the most recent device-motion magnitude, if any.
pub fn detect(
    previous: Option<&PositionSample>,
    current: &PositionSample,
    config: &TrackerConfig,
    last_magnitude: Option<f64>,
) -> Vec<BehaviorEvent> {
    let mut events = Vec::new();

    let elapsed = previous.map(|prev| elapsed_secs(&prev.timestamp, &current.timestamp));
    let threshold = config.sensitivity.threshold();

    // Never earlier than the sample it was derived from.
    let event_time = match previous {
        Some(prev) if prev.timestamp > current.timestamp => prev.timestamp,
        _ => current.timestamp,
    };

    let context = json!({
        "previous_speed": previous.map(|p| p.speed),
        "current_speed": current.speed,
        "elapsed_secs": elapsed,
        "last_magnitude": last_magnitude,
        "max_speed": config.max_speed,
        "sensitivity": config.sensitivity.as_str(),
        "threshold": threshold,
    });

    let base = |event_type: EventType, description: String| BehaviorEvent {
        event_type,
        event_time,
        latitude: current.latitude,
        longitude: current.longitude,
        speed: Some(current.speed),
        max_speed: None,
        acceleration: None,
        impact_force: None,
        description,
        raw_context: context.clone(),
        notified: false,
        synced: false,
    };

    let limit = f64::from(config.max_speed);
    if current.speed > limit {
        events.push(BehaviorEvent {
            max_speed: Some(limit),
            ..base(
                EventType::Speeding,
                format!(
                    "speed {} km/h exceeds limit {} km/h",
                    current.speed.round(),
                    config.max_speed
                ),
            )
        });
    }

    if let (Some(prev), Some(elapsed)) = (previous, elapsed) {
        if elapsed > 0.0 {
            let rate = (current.speed - prev.speed).abs() * KMH_TO_MS / elapsed;
            if rate > threshold {
                let (event_type, label) = if current.speed > prev.speed {
                    (EventType::HarshAcceleration, "harsh acceleration")
                } else {
                    (EventType::HarshBraking, "harsh braking")
                };
                events.push(BehaviorEvent {
                    acceleration: Some(rate),
                    ..base(event_type, format!("{}: {:.2} m/s²", label, rate))
                });
            }

            // A zero magnitude means no motion reading yet
            if let Some(magnitude) = last_magnitude.filter(|m| *m != 0.0) {
                let delta = (magnitude - current.speed).abs() / elapsed;
                if delta > CRASH_THRESHOLD {
                    events.push(BehaviorEvent {
                        impact_force: Some(delta),
                        ..base(
                            EventType::Crash,
                            format!("possible crash detected: {:.2} m/s²", delta),
                        )
                    });
                }
            }
        }
    }

    events
}

/// Magnitude of a device acceleration vector, gravity included.
pub fn motion_magnitude(x: f64, y: f64, z: f64) -> f64 {
    MotionReading { x, y, z }.magnitude()
}

/// Seconds between two timestamps, millisecond precision. Negative when out of order.
fn elapsed_secs(from: &DateTime<Utc>, to: &DateTime<Utc>) -> f64 {
    (*to - *from).num_milliseconds() as f64 / 1000.0
}

/// Detection state carried along the sequential ingestion path.
///
/// Holds the last persisted sample and the rolling device-motion magnitude.
/// The previous sample only advances through [`DetectorState::commit`], so a
/// caller whose store write failed can re-run the same sample.
#[derive(Debug, Default, Clone)]
pub struct DetectorState {
    previous: Option<PositionSample>,
    last_magnitude: Option<f64>,
}

impl DetectorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest device-motion magnitude.
    pub fn observe_motion(&mut self, magnitude: f64) {
        if magnitude.is_finite() {
            self.last_magnitude = Some(magnitude);
        }
    }

    /// Run [`detect`] against the carried state without changing it.
    pub fn evaluate(&self, current: &PositionSample, config: &TrackerConfig) -> Vec<BehaviorEvent> {
        detect(self.previous.as_ref(), current, config, self.last_magnitude)
    }

    /// Make `sample` the previous sample for the next evaluation.
    pub fn commit(&mut self, sample: PositionSample) {
        self.previous = Some(sample);
    }

    pub fn previous(&self) -> Option<&PositionSample> {
        self.previous.as_ref()
    }

    pub fn last_magnitude(&self) -> Option<f64> {
        self.last_magnitude
    }

    /// Forget the previous sample, e.g. when tracking restarts.
    pub fn reset(&mut self) {
        self.previous = None;
        self.last_magnitude = None;
    }
}
