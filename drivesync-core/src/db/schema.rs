//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: record tables
    r#"
    -- ============================================
    -- Producer-side tables (append-only)
    -- ============================================

    CREATE TABLE IF NOT EXISTS positions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        client_id        TEXT NOT NULL UNIQUE,
        recorded_at      TEXT NOT NULL,
        latitude         REAL NOT NULL,
        longitude        REAL NOT NULL,
        speed            REAL NOT NULL,
        accuracy         REAL,
        altitude         REAL,
        heading          REAL,
        device_info      JSON NOT NULL DEFAULT '{}',

        -- Sync bookkeeping
        synced           INTEGER NOT NULL DEFAULT 0,
        in_flight        INTEGER NOT NULL DEFAULT 0,
        created_at       TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        client_id        TEXT NOT NULL UNIQUE,
        event_type       TEXT NOT NULL,
        event_time       TEXT NOT NULL,
        latitude         REAL NOT NULL,
        longitude        REAL NOT NULL,
        speed            REAL,
        max_speed        REAL,
        acceleration     REAL,
        impact_force     REAL,
        description      TEXT NOT NULL,
        event_data       JSON NOT NULL,

        -- Delivery bookkeeping
        notified         INTEGER NOT NULL DEFAULT 0,
        synced           INTEGER NOT NULL DEFAULT 0,
        in_flight        INTEGER NOT NULL DEFAULT 0,
        created_at       TEXT NOT NULL
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_positions_unsynced ON positions(synced, id);
    CREATE INDEX IF NOT EXISTS idx_positions_recorded_at ON positions(recorded_at);
    CREATE INDEX IF NOT EXISTS idx_events_unsynced ON events(synced, id);
    CREATE INDEX IF NOT EXISTS idx_events_time ON events(event_time);
    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
    "#,
    // Version 2: synced is one-way
    r#"
    CREATE TRIGGER IF NOT EXISTS positions_synced_one_way
    BEFORE UPDATE OF synced ON positions
    WHEN OLD.synced = 1 AND NEW.synced = 0
    BEGIN
        SELECT RAISE(ABORT, 'positions.synced cannot go from 1 to 0');
    END;

    CREATE TRIGGER IF NOT EXISTS events_synced_one_way
    BEFORE UPDATE OF synced ON events
    WHEN OLD.synced = 1 AND NEW.synced = 0
    BEGIN
        SELECT RAISE(ABORT, 'events.synced cannot go from 1 to 0');
    END;
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
