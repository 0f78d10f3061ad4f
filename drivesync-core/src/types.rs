//! Core domain types for drivesync
//!
//! These types describe what the client observes (position samples and
//! device-motion readings), what it derives (behavior events), and how the
//! tracker is tuned.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Sample** | One GPS position reading with measured speed |
//! | **Motion reading** | One device accelerometer reading (including gravity) |
//! | **Event** | A classified driving-behavior occurrence derived from one or two samples |
//! | **Sensitivity** | Named threshold tier controlling harsh-acceleration strictness |
//! | **Stored record** | A sample or event after the local store assigned it an id |
//!
//! Speeds are always km/h on the wire and in storage; accelerations are m/s².

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Opaque device metadata attached to each sample (user agent, platform, ...).
pub type DeviceInfo = BTreeMap<String, serde_json::Value>;

// ============================================
// Sensor input
// ============================================

/// One GPS position reading.
///
/// Immutable once created; the local store owns it after persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// When the fix was taken
    #[serde(rename = "recorded_at")]
    pub timestamp: DateTime<Utc>,
    /// Degrees, -90..=90
    pub latitude: f64,
    /// Degrees, -180..=180
    pub longitude: f64,
    /// Ground speed in km/h
    #[serde(default)]
    pub speed: f64,
    /// Horizontal accuracy in meters
    #[serde(default)]
    pub accuracy: Option<f64>,
    /// Altitude in meters
    #[serde(default)]
    pub altitude: Option<f64>,
    /// Course over ground in degrees, 0..360
    #[serde(default)]
    pub heading: Option<f64>,
    /// Opaque device metadata
    #[serde(default)]
    pub device_info: DeviceInfo,
}

impl PositionSample {
    /// Create a sample with no optional fields set.
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64, speed: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            speed,
            accuracy: None,
            altitude: None,
            heading: None,
            device_info: DeviceInfo::new(),
        }
    }

    /// Reject samples that must never reach the store.
    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::validation(
                "latitude",
                format!("{} is outside -90..=90", self.latitude),
            ));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::validation(
                "longitude",
                format!("{} is outside -180..=180", self.longitude),
            ));
        }
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(Error::validation(
                "speed",
                format!("{} must be a non-negative number", self.speed),
            ));
        }
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(Error::validation(
                    "accuracy",
                    format!("{} must be a non-negative number", accuracy),
                ));
            }
        }
        if let Some(altitude) = self.altitude {
            if !altitude.is_finite() {
                return Err(Error::validation("altitude", "must be finite"));
            }
        }
        if let Some(heading) = self.heading {
            if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
                return Err(Error::validation(
                    "heading",
                    format!("{} is outside 0..360", heading),
                ));
            }
        }
        Ok(())
    }
}

/// One accelerometer reading, gravity included, in m/s².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MotionReading {
    /// Euclidean magnitude of the acceleration vector.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Anything the sampler can produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorReading {
    Position(PositionSample),
    Motion(MotionReading),
}

// ============================================
// Behavior events
// ============================================

/// Kind of driving behavior the detector recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Speeding,
    HarshAcceleration,
    HarshBraking,
    Crash,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Speeding,
        EventType::HarshAcceleration,
        EventType::HarshBraking,
        EventType::Crash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Speeding => "speeding",
            EventType::HarshAcceleration => "harsh_acceleration",
            EventType::HarshBraking => "harsh_braking",
            EventType::Crash => "crash",
        }
    }

    /// Short title used by notification and UI layers.
    pub fn title(&self) -> &'static str {
        match self {
            EventType::Speeding => "Speeding",
            EventType::HarshAcceleration => "Harsh acceleration",
            EventType::HarshBraking => "Harsh braking",
            EventType::Crash => "Possible crash",
        }
    }

    /// Crash notifications should stay on screen until acknowledged.
    pub fn requires_interaction(&self) -> bool {
        matches!(self, EventType::Crash)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "speeding" => Ok(EventType::Speeding),
            "harsh_acceleration" => Ok(EventType::HarshAcceleration),
            "harsh_braking" => Ok(EventType::HarshBraking),
            "crash" => Ok(EventType::Crash),
            _ => Err(format!("unknown event type: {}", s)),
        }
    }
}

/// A classified driving-behavior occurrence.
///
/// Created only by the detector. `notified` and `synced` are the only fields
/// mutated after creation, and only through the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorEvent {
    pub event_type: EventType,
    pub event_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// km/h at the time of the event
    pub speed: Option<f64>,
    /// Configured limit, speeding only
    pub max_speed: Option<f64>,
    /// m/s², harsh acceleration/braking only
    pub acceleration: Option<f64>,
    /// Crash only
    pub impact_force: Option<f64>,
    pub description: String,
    /// Snapshot of the detector inputs that produced this event
    #[serde(rename = "event_data")]
    pub raw_context: serde_json::Value,
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub synced: bool,
}

// ============================================
// Stored records
// ============================================

/// The two record tables in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Positions,
    Events,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Positions => "positions",
            Table::Events => "events",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted position sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPosition {
    /// Local identifier, assigned monotonically and never reused
    pub id: i64,
    /// Globally unique key the server uses to drop duplicate deliveries
    pub client_id: String,
    pub sample: PositionSample,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
}

/// A persisted behavior event.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub id: i64,
    pub client_id: String,
    pub event: BehaviorEvent,
    pub created_at: DateTime<Utc>,
}

/// Per-type event totals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub speeding: u64,
    pub harsh_acceleration: u64,
    pub harsh_braking: u64,
    pub crash: u64,
}

impl EventCounts {
    pub fn get(&self, event_type: EventType) -> u64 {
        match event_type {
            EventType::Speeding => self.speeding,
            EventType::HarshAcceleration => self.harsh_acceleration,
            EventType::HarshBraking => self.harsh_braking,
            EventType::Crash => self.crash,
        }
    }

    pub fn increment(&mut self, event_type: EventType, by: u64) {
        match event_type {
            EventType::Speeding => self.speeding += by,
            EventType::HarshAcceleration => self.harsh_acceleration += by,
            EventType::HarshBraking => self.harsh_braking += by,
            EventType::Crash => self.crash += by,
        }
    }

    pub fn total(&self) -> u64 {
        self.speeding + self.harsh_acceleration + self.harsh_braking + self.crash
    }
}

/// Unsynced backlog per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub positions: u64,
    pub events: u64,
}

// ============================================
// Tracker configuration
// ============================================

/// Harsh-acceleration threshold tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Medium,
    High,
    /// A value we do not know; detection falls back to the medium threshold
    #[serde(other)]
    Unrecognized,
}

impl Sensitivity {
    /// Acceleration threshold in m/s².
    pub fn threshold(&self) -> f64 {
        match self {
            Sensitivity::Low => 3.0,
            Sensitivity::Medium | Sensitivity::Unrecognized => 5.0,
            Sensitivity::High => 8.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
            Sensitivity::Unrecognized => "unrecognized",
        }
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Sensitivity::Medium
    }
}

impl std::str::FromStr for Sensitivity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Sensitivity::Low),
            "medium" => Ok(Sensitivity::Medium),
            "high" => Ok(Sensitivity::High),
            _ => Err(Error::validation(
                "sensitivity",
                format!("'{}' is not one of low, medium, high", s),
            )),
        }
    }
}

/// Tunable tracker thresholds.
///
/// Replaced wholesale through [`crate::ConfigStore::save`]; never partially
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Speed limit in km/h (1..=200)
    pub max_speed: u32,
    /// Seconds between position samples (5..=300)
    pub sample_interval: u64,
    pub sensitivity: Sensitivity,
    pub notifications: bool,
    pub auto_start: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_speed: 95,
            sample_interval: 60,
            sensitivity: Sensitivity::Medium,
            notifications: true,
            auto_start: true,
        }
    }
}

impl TrackerConfig {
    pub const MAX_SPEED_RANGE: std::ops::RangeInclusive<u32> = 1..=200;
    pub const SAMPLE_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 5..=300;

    /// Check every field, reporting the first one out of range.
    pub fn validate(&self) -> Result<()> {
        if !Self::MAX_SPEED_RANGE.contains(&self.max_speed) {
            return Err(Error::validation(
                "max_speed",
                format!("{} is outside 1..=200 km/h", self.max_speed),
            ));
        }
        if !Self::SAMPLE_INTERVAL_RANGE.contains(&self.sample_interval) {
            return Err(Error::validation(
                "sample_interval",
                format!("{} is outside 5..=300 seconds", self.sample_interval),
            ));
        }
        if self.sensitivity == Sensitivity::Unrecognized {
            return Err(Error::validation(
                "sensitivity",
                "must be one of low, medium, high",
            ));
        }
        Ok(())
    }
}
