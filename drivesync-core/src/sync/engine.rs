//! Sync cycle
//!
//! One cycle drains each table in order (positions, then events):
//!
//! ```text
//! Idle → Draining → Sending → Reconciling ─┬→ Draining (full batch acked)
//!                                           └→ next table / prune → Idle
//! ```
//!
//! - **Draining** claims the oldest unsynced rows, up to the batch size.
//! - **Sending** posts them as one batch.
//! - **Reconciling** marks the whole batch synced on success, or releases the
//!   claim on failure so the rows are retried next cycle.
//!
//! A table stops at its first failure. [`Error::BatchTooLarge`] halves the
//! batch size once per table per cycle. Only one cycle runs at a time; a
//! trigger that arrives during a cycle returns [`CycleOutcome::Coalesced`]
//! without touching the network.
//!
//! If a cycle future is dropped mid-send its claims stay set until the next
//! [`SyncEngine::new`] releases them. A batch the server stored but never
//! acknowledged is re-sent; `client_id` lets the server drop the duplicate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::types::{StoredEvent, StoredPosition, Table};

use super::client::{BatchAck, RemoteApi};

/// Where the engine is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Draining,
    Sending,
    Reconciling,
    /// Offline; triggers are ignored until connectivity returns
    Suspended,
}

/// Result of asking the engine to run.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(SyncReport),
    /// Another cycle was already running
    Coalesced,
    /// The engine is offline
    Suspended,
}

/// Per-table result of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableReport {
    /// Records acknowledged and marked synced
    pub sent: usize,
    /// Batches acknowledged
    pub batches: usize,
    /// Batches that failed (0 or 1, a table stops at its first failure)
    pub failures: usize,
    /// Times the batch size was halved
    pub halvings: usize,
    pub last_error: Option<String>,
}

impl TableReport {
    fn record_failure(&mut self, table: Table, error: &Error) {
        self.failures += 1;
        self.last_error = Some(error.to_string());
        if error.is_transient() {
            tracing::info!(table = %table, error = %error, "Sync deferred, will retry next cycle");
        } else {
            tracing::warn!(table = %table, error = %error, "Sync batch failed");
        }
    }
}

/// Result of one completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub positions: TableReport,
    pub events: TableReport,
    pub pruned_positions: usize,
    pub pruned_events: usize,
}

impl SyncReport {
    /// True when every table finished without a failed batch.
    pub fn is_clean(&self) -> bool {
        self.positions.failures == 0 && self.events.failures == 0
    }
}

/// Totals across all cycles since the engine was created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    pub cycles: usize,
    pub coalesced: usize,
    pub positions_sent: usize,
    pub events_sent: usize,
    pub failed_batches: usize,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Batch sizes and retention windows for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub position_batch_size: usize,
    pub event_batch_size: usize,
    pub position_retention: chrono::Duration,
    pub event_retention: chrono::Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            position_batch_size: config.sync.position_batch_size,
            event_batch_size: config.sync.event_batch_size,
            position_retention: config.retention.position_retention(),
            event_retention: config.retention.event_retention(),
        }
    }
}

/// A table the engine can drain.
#[async_trait]
trait Outbox: Sized + Send + Sync {
    const TABLE: Table;

    fn id(&self) -> i64;

    fn claim(store: &LocalStore, limit: usize) -> Result<Vec<Self>>;

    async fn send(remote: &dyn RemoteApi, batch: &[Self]) -> Result<BatchAck>;
}

#[async_trait]
impl Outbox for StoredPosition {
    const TABLE: Table = Table::Positions;

    fn id(&self) -> i64 {
        self.id
    }

    fn claim(store: &LocalStore, limit: usize) -> Result<Vec<Self>> {
        store.claim_positions(limit)
    }

    async fn send(remote: &dyn RemoteApi, batch: &[Self]) -> Result<BatchAck> {
        remote.send_positions(batch).await
    }
}

#[async_trait]
impl Outbox for StoredEvent {
    const TABLE: Table = Table::Events;

    fn id(&self) -> i64 {
        self.id
    }

    fn claim(store: &LocalStore, limit: usize) -> Result<Vec<Self>> {
        store.claim_events(limit)
    }

    async fn send(remote: &dyn RemoteApi, batch: &[Self]) -> Result<BatchAck> {
        remote.send_events(batch).await
    }
}

/// Clears the single-flight flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the local store into the remote API.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    settings: SyncSettings,
    running: AtomicBool,
    online: AtomicBool,
    state: Mutex<SyncState>,
    stats: Mutex<SyncStats>,
}

impl SyncEngine {
    /// Create the engine and release claims left behind by an earlier process.
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteApi>,
        settings: SyncSettings,
    ) -> Result<Self> {
        let released = store.release_all_claims()?;
        if released > 0 {
            tracing::info!(released, "Released stale in-flight claims");
        }

        Ok(Self {
            store,
            remote,
            settings,
            running: AtomicBool::new(false),
            online: AtomicBool::new(true),
            state: Mutex::new(SyncState::Idle),
            stats: Mutex::new(SyncStats::default()),
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Record a connectivity change.
    ///
    /// Going offline suspends the engine; a running cycle finishes on its
    /// own. Coming back online returns it to idle, ready for a trigger.
    pub fn set_online(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        if was_online == online {
            return;
        }

        if !self.running.load(Ordering::Acquire) {
            self.set_state(if online {
                SyncState::Idle
            } else {
                SyncState::Suspended
            });
        }
        tracing::info!(online, "Connectivity changed");
    }

    /// Run one sync cycle unless one is already running or the engine is offline.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if !self.is_online() {
            self.set_state(SyncState::Suspended);
            tracing::debug!("Offline, skipping sync cycle");
            return CycleOutcome::Suspended;
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats_mut(|s| s.coalesced += 1);
            tracing::debug!("Sync cycle already running, coalescing trigger");
            return CycleOutcome::Coalesced;
        }
        let _guard = RunningGuard(&self.running);

        let report = self.cycle().await;

        self.set_state(if self.is_online() {
            SyncState::Idle
        } else {
            SyncState::Suspended
        });

        self.stats_mut(|s| {
            s.cycles += 1;
            s.positions_sent += report.positions.sent;
            s.events_sent += report.events.sent;
            s.failed_batches += report.positions.failures + report.events.failures;
            if report.is_clean() {
                s.last_success = Some(report.started_at);
            } else {
                s.last_error = report
                    .positions
                    .last_error
                    .clone()
                    .or_else(|| report.events.last_error.clone());
            }
        });

        tracing::info!(
            positions_sent = report.positions.sent,
            events_sent = report.events.sent,
            failures = report.positions.failures + report.events.failures,
            pruned_positions = report.pruned_positions,
            pruned_events = report.pruned_events,
            duration_ms = report.duration.as_millis() as u64,
            "Sync cycle complete"
        );

        CycleOutcome::Completed(report)
    }

    async fn cycle(&self) -> SyncReport {
        let started_at = Utc::now();
        let start = Instant::now();

        let positions = self
            .drain::<StoredPosition>(self.settings.position_batch_size)
            .await;
        let events = self
            .drain::<StoredEvent>(self.settings.event_batch_size)
            .await;

        let pruned_positions = self.prune(Table::Positions, self.settings.position_retention);
        let pruned_events = self.prune(Table::Events, self.settings.event_retention);

        SyncReport {
            started_at,
            duration: start.elapsed(),
            positions,
            events,
            pruned_positions,
            pruned_events,
        }
    }

    async fn drain<T: Outbox>(&self, batch_size: usize) -> TableReport {
        let table = T::TABLE;
        let mut report = TableReport::default();
        let mut limit = batch_size.max(1);
        let mut halved = false;

        loop {
            self.set_state(SyncState::Draining);
            let batch = match T::claim(&self.store, limit) {
                Ok(batch) => batch,
                Err(e) => {
                    report.record_failure(table, &e);
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            let ids: Vec<i64> = batch.iter().map(T::id).collect();

            self.set_state(SyncState::Sending);
            tracing::debug!(table = %table, size = ids.len(), "Sending batch");
            let result = T::send(self.remote.as_ref(), &batch).await;

            self.set_state(SyncState::Reconciling);
            match result {
                Ok(_ack) => {
                    if let Err(e) = self.store.mark_synced(table, &ids) {
                        // Left unsynced; the next cycle re-sends with the same client_ids
                        self.release(table, &ids);
                        report.record_failure(table, &e);
                        break;
                    }
                    report.sent += ids.len();
                    report.batches += 1;

                    if ids.len() < limit {
                        break;
                    }
                }
                Err(Error::BatchTooLarge { size }) if !halved && limit > 1 => {
                    self.release(table, &ids);
                    halved = true;
                    limit = (limit / 2).max(1);
                    report.halvings += 1;
                    tracing::warn!(table = %table, rejected = size, retry_with = limit, "Batch too large, halving");
                }
                Err(e) => {
                    self.release(table, &ids);
                    report.record_failure(table, &e);
                    break;
                }
            }
        }

        report
    }

    fn release(&self, table: Table, ids: &[i64]) {
        if let Err(e) = self.store.release(table, ids) {
            tracing::warn!(table = %table, error = %e, "Failed to release claim");
        }
    }

    fn prune(&self, table: Table, retention: chrono::Duration) -> usize {
        match self.store.prune_older_than(table, Utc::now() - retention) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Prune failed");
                0
            }
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn stats_mut(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
