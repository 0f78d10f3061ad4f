//! Storage layer for drivesync
//!
//! SQLite-backed local store with:
//! - Schema migrations
//! - Append-only record tables with sync bookkeeping
//! - Age-based pruning

pub mod repo;
pub mod schema;

pub use repo::{AppendedObservation, LocalStore};
