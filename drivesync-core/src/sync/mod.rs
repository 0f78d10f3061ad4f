//! Offline-first synchronization
//!
//! - [`client`]: the remote batch API ([`RemoteApi`]) and its HTTP implementation
//! - [`engine`]: the drain / send / reconcile cycle
//! - [`scheduler`]: interval and connectivity triggers

pub mod client;
pub mod engine;
pub mod scheduler;

pub use client::{BatchAck, HttpRemoteApi, RemoteApi};
pub use engine::{
    CycleOutcome, SyncEngine, SyncReport, SyncSettings, SyncState, SyncStats, TableReport,
};
pub use scheduler::{remote_reachable, Connectivity, ShutdownHandle, SyncScheduler, Trigger};
