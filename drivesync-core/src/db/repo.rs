//! Local record store
//!
//! Durable persistence for position samples and behavior events. Rows are
//! appended by the tracker and afterwards only have their bookkeeping flags
//! changed (`synced`, `notified`, `in_flight`) or are pruned by age.
//!
//! ## In-flight claims
//!
//! The sync engine does not just read unsynced rows; it *claims* them. A claim
//! sets `in_flight = 1` inside an IMMEDIATE transaction, so the batch it
//! returns is a consistent snapshot and pruning skips those rows until the
//! batch is acknowledged ([`LocalStore::mark_synced`]) or given back
//! ([`LocalStore::release`]).

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// SQLite variable budget per statement when expanding `IN (...)` lists.
const ID_CHUNK: usize = 500;

/// Ids assigned to one persisted sample and the events derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedObservation {
    pub position_id: i64,
    pub event_ids: Vec<i64>,
}

/// Durable local store with one connection per handle.
///
/// Open one handle per component (tracker, sync engine). WAL journaling lets
/// the tracker keep appending while the sync engine reads.
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        // FULL sync: a returned append survives power loss
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn();
        super::schema::run_migrations(&conn)
    }

    /// Backing file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============================================
    // Appends (producer side)
    // ============================================

    /// Persist one position sample. Returns its local id.
    pub fn append_position(&self, sample: &PositionSample) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = insert_position(&tx, sample)?;
        tx.commit()?;
        Ok(id)
    }

    /// Persist one behavior event. Returns its local id.
    pub fn append_event(&self, event: &BehaviorEvent) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let id = insert_event(&tx, event)?;
        tx.commit()?;
        Ok(id)
    }

    /// Persist a sample together with the events detected from it.
    ///
    /// All rows commit together or none do; on error the caller retries the
    /// whole detection + append unit.
    pub fn append_observation(
        &self,
        sample: &PositionSample,
        events: &[BehaviorEvent],
    ) -> Result<AppendedObservation> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let position_id = insert_position(&tx, sample)?;
        let mut event_ids = Vec::with_capacity(events.len());
        for event in events {
            event_ids.push(insert_event(&tx, event)?);
        }

        tx.commit()?;

        tracing::trace!(position_id, events = event_ids.len(), "Observation appended");

        Ok(AppendedObservation {
            position_id,
            event_ids,
        })
    }

    // ============================================
    // Reads
    // ============================================

    /// Oldest unsynced positions first, at most `limit`.
    pub fn unsynced_positions(&self, limit: usize) -> Result<Vec<StoredPosition>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM positions WHERE synced = 0 ORDER BY id ASC LIMIT ?")?;
        let rows = stmt
            .query_map([limit as i64], row_to_position)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Oldest unsynced events first, at most `limit`.
    pub fn unsynced_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM events WHERE synced = 0 ORDER BY id ASC LIMIT ?")?;
        let rows = stmt
            .query_map([limit as i64], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Get a position by local id
    pub fn get_position(&self, id: i64) -> Result<Option<StoredPosition>> {
        let conn = self.conn();
        conn.query_row("SELECT * FROM positions WHERE id = ?", [id], row_to_position)
            .optional()
            .map_err(Error::from)
    }

    /// Get an event by local id
    pub fn get_event(&self, id: i64) -> Result<Option<StoredEvent>> {
        let conn = self.conn();
        conn.query_row("SELECT * FROM events WHERE id = ?", [id], row_to_event)
            .optional()
            .map_err(Error::from)
    }

    /// Events the notification layer has not delivered yet, oldest first.
    pub fn unnotified_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM events WHERE notified = 0 ORDER BY id ASC LIMIT ?")?;
        let rows = stmt
            .query_map([limit as i64], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Total rows in a table
    pub fn count(&self, table: Table) -> Result<u64> {
        let conn = self.conn();
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.as_str()),
            [],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    /// Unsynced backlog per table
    pub fn pending_counts(&self) -> Result<PendingCounts> {
        let conn = self.conn();
        let positions: i64 =
            conn.query_row("SELECT COUNT(*) FROM positions WHERE synced = 0", [], |r| {
                r.get(0)
            })?;
        let events: i64 =
            conn.query_row("SELECT COUNT(*) FROM events WHERE synced = 0", [], |r| {
                r.get(0)
            })?;
        Ok(PendingCounts {
            positions: positions as u64,
            events: events as u64,
        })
    }

    /// Stored events grouped by type
    pub fn event_counts(&self) -> Result<EventCounts> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT event_type, COUNT(*) FROM events GROUP BY event_type")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut counts = EventCounts::default();
        for (event_type, n) in rows {
            match event_type.parse::<EventType>() {
                Ok(t) => counts.increment(t, n as u64),
                Err(e) => tracing::warn!(error = %e, "Skipping unknown event type in counts"),
            }
        }
        Ok(counts)
    }

    // ============================================
    // Sync bookkeeping
    // ============================================

    /// Claim up to `limit` unsynced, unclaimed positions for a sync batch.
    pub fn claim_positions(&self, limit: usize) -> Result<Vec<StoredPosition>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = {
            let mut stmt = tx.prepare(
                "SELECT * FROM positions WHERE synced = 0 AND in_flight = 0 ORDER BY id ASC LIMIT ?",
            )?;
            let rows = stmt
                .query_map([limit as i64], row_to_position)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        set_flag(&tx, Table::Positions, "in_flight = 1", "in_flight = 0", &ids)?;
        tx.commit()?;
        Ok(rows)
    }

    /// Claim up to `limit` unsynced, unclaimed events for a sync batch.
    pub fn claim_events(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = {
            let mut stmt = tx.prepare(
                "SELECT * FROM events WHERE synced = 0 AND in_flight = 0 ORDER BY id ASC LIMIT ?",
            )?;
            let rows = stmt
                .query_map([limit as i64], row_to_event)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        set_flag(&tx, Table::Events, "in_flight = 1", "in_flight = 0", &ids)?;
        tx.commit()?;
        Ok(rows)
    }

    /// Flip `synced` to true for `ids` and drop their claim.
    ///
    /// Idempotent; unknown ids are ignored. Returns how many rows changed
    /// from unsynced to synced.
    pub fn mark_synced(&self, table: Table, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        set_flag(&tx, table, "in_flight = 0", "in_flight = 1", ids)?;
        let flipped = set_flag(&tx, table, "synced = 1", "synced = 0", ids)?;
        tx.commit()?;
        Ok(flipped)
    }

    /// Drop the claim on `ids` without syncing them (failed batch).
    pub fn release(&self, table: Table, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let released = set_flag(&tx, table, "in_flight = 0", "in_flight = 1", ids)?;
        tx.commit()?;
        Ok(released)
    }

    /// Drop every claim. Used when a sync owner starts, since claims cannot
    /// outlive the process that made them.
    pub fn release_all_claims(&self) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut released = 0;
        for table in [Table::Positions, Table::Events] {
            released += tx.execute(
                &format!(
                    "UPDATE {} SET in_flight = 0 WHERE in_flight = 1",
                    table.as_str()
                ),
                [],
            )?;
        }
        tx.commit()?;
        Ok(released)
    }

    /// Mark events as delivered by the notification layer.
    pub fn mark_notified(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let changed = set_flag(&tx, Table::Events, "notified = 1", "notified = 0", ids)?;
        tx.commit()?;
        Ok(changed)
    }

    // ============================================
    // Deletion
    // ============================================

    /// Delete rows older than `cutoff`, synced or not, except claimed rows.
    ///
    /// Age is `recorded_at` for positions and `event_time` for events.
    pub fn prune_older_than(&self, table: Table, cutoff: DateTime<Utc>) -> Result<usize> {
        let column = match table {
            Table::Positions => "recorded_at",
            Table::Events => "event_time",
        };
        let conn = self.conn();
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} < ?1 AND in_flight = 0",
                table.as_str(),
                column
            ),
            [format_ts(&cutoff)],
        )?;
        if deleted > 0 {
            tracing::debug!(table = %table, deleted, cutoff = %cutoff, "Pruned old records");
        }
        Ok(deleted)
    }

    /// Delete all events that are not part of an in-flight batch.
    pub fn clear_events(&self) -> Result<usize> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM events WHERE in_flight = 0", [])?;
        tracing::info!(deleted, "Cleared local events");
        Ok(deleted)
    }
}

// ============================================
// Row helpers
// ============================================

/// Canonical timestamp encoding. Fixed width UTC, so text order is time order.
pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_column(row: &Row, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(name)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            let idx = row.as_ref().column_index(name).unwrap_or(0);
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
        })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, name: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(name)?;
    serde_json::from_str(&raw).map_err(|e| {
        let idx = row.as_ref().column_index(name).unwrap_or(0);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

fn insert_position(conn: &Connection, sample: &PositionSample) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO positions (client_id, recorded_at, latitude, longitude, speed,
                               accuracy, altitude, heading, device_info, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            uuid::Uuid::new_v4().to_string(),
            format_ts(&sample.timestamp),
            sample.latitude,
            sample.longitude,
            sample.speed,
            sample.accuracy,
            sample.altitude,
            sample.heading,
            serde_json::to_string(&sample.device_info)?,
            format_ts(&Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_event(conn: &Connection, event: &BehaviorEvent) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO events (client_id, event_type, event_time, latitude, longitude, speed,
                            max_speed, acceleration, impact_force, description, event_data,
                            created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            uuid::Uuid::new_v4().to_string(),
            event.event_type.as_str(),
            format_ts(&event.event_time),
            event.latitude,
            event.longitude,
            event.speed,
            event.max_speed,
            event.acceleration,
            event.impact_force,
            event.description,
            event.raw_context.to_string(),
            format_ts(&Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// `UPDATE table SET {set} WHERE id IN (ids) AND {unless}`, chunked.
fn set_flag(conn: &Connection, table: Table, set: &str, only_if: &str, ids: &[i64]) -> Result<usize> {
    let mut changed = 0;
    for chunk in ids.chunks(ID_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} AND id IN ({})",
            table.as_str(),
            set,
            only_if,
            placeholders
        );
        changed += conn.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(changed)
}

fn row_to_position(row: &Row) -> rusqlite::Result<StoredPosition> {
    Ok(StoredPosition {
        id: row.get("id")?,
        client_id: row.get("client_id")?,
        sample: PositionSample {
            timestamp: ts_column(row, "recorded_at")?,
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
            speed: row.get("speed")?,
            accuracy: row.get("accuracy")?,
            altitude: row.get("altitude")?,
            heading: row.get("heading")?,
            device_info: json_column(row, "device_info")?,
        },
        synced: row.get::<_, i64>("synced")? != 0,
        created_at: ts_column(row, "created_at")?,
    })
}

fn row_to_event(row: &Row) -> rusqlite::Result<StoredEvent> {
    let event_type_str: String = row.get("event_type")?;
    let event_type = event_type_str.parse::<EventType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })?;

    Ok(StoredEvent {
        id: row.get("id")?,
        client_id: row.get("client_id")?,
        event: BehaviorEvent {
            event_type,
            event_time: ts_column(row, "event_time")?,
            latitude: row.get("latitude")?,
            longitude: row.get("longitude")?,
            speed: row.get("speed")?,
            max_speed: row.get("max_speed")?,
            acceleration: row.get("acceleration")?,
            impact_force: row.get("impact_force")?,
            description: row.get("description")?,
            raw_context: json_column(row, "event_data")?,
            notified: row.get::<_, i64>("notified")? != 0,
            synced: row.get::<_, i64>("synced")? != 0,
        },
        created_at: ts_column(row, "created_at")?,
    })
}
