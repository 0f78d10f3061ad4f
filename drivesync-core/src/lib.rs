//! # drivesync-core
//!
//! Core library for drivesync - offline-first driving telemetry.
//!
//! This library provides:
//! - Domain types for position samples, behavior events and tracker settings
//! - Driving-behavior detection
//! - Durable local storage with SQLite
//! - Batch synchronization with a remote API
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Architecture
//!
//! Data flows one way:
//! - **Sampler:** sensor readings (positions, device motion)
//! - **Tracker:** detection + durable append, one transaction per sample
//! - **Local store:** the source of truth until the server acknowledges
//! - **Sync engine:** drains unsynced rows in batches, marks them synced
//!
//! ## Example
//!
//! ```rust,no_run
//! use drivesync_core::{Config, LocalStore};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open the local store
//! let store = LocalStore::open(&Config::database_path()).expect("failed to open store");
//! store.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use config_store::ConfigStore;
pub use db::LocalStore;
pub use detector::{detect, motion_magnitude, DetectorState};
pub use error::{Error, Result};
pub use sampler::{JsonlSource, PositionSampler, ReplaySource, SensorSource};
pub use sync::{CycleOutcome, HttpRemoteApi, RemoteApi, SyncEngine, SyncScheduler, SyncState};
pub use tracker::{Tracker, TrackerObserver, TrackerStats};
pub use types::*;

// Public modules
pub mod config;
pub mod config_store;
pub mod db;
pub mod detector;
pub mod error;
pub mod logging;
pub mod sampler;
pub mod sync;
pub mod tracker;
pub mod types;
