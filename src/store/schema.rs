//! Schema creation and connection pragmas

use rusqlite::Connection;

use super::StoreError;

/// Current schema version, stored in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS alerts (
    id              TEXT PRIMARY KEY,
    message_id      INTEGER NOT NULL,
    follow_up_ids   TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL,
    severity        INTEGER NOT NULL,
    hostname        TEXT NOT NULL DEFAULT '',
    problem_name    TEXT NOT NULL DEFAULT '',
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    resolved_at     INTEGER,
    acknowledged_at INTEGER,
    metadata        TEXT
);

CREATE TABLE IF NOT EXISTS statistics (
    date        TEXT NOT NULL,
    metric_name TEXT NOT NULL,
    value       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (date, metric_name)
);

CREATE TABLE IF NOT EXISTS events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    alert_id   TEXT,
    details    TEXT,
    timestamp  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status);
CREATE INDEX IF NOT EXISTS idx_alerts_created_at ON alerts(created_at);
CREATE INDEX IF NOT EXISTS idx_statistics_date ON statistics(date);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
";

/// Pragmas applied to every connection
pub fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    Ok(())
}

/// Version 1 kept only the first part of split messages
const ADD_FOLLOW_UP_IDS: &str =
    "ALTER TABLE alerts ADD COLUMN follow_up_ids TEXT NOT NULL DEFAULT '[]'";

/// Create tables and indexes when missing, upgrading older layouts
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Corrupted(format!(
            "database schema version {} is newer than supported {}",
            version, SCHEMA_VERSION
        )));
    }

    if version == 1 {
        tracing::info!(from = version, to = SCHEMA_VERSION, "Upgrading alert store schema");
        conn.execute_batch(ADD_FOLLOW_UP_IDS)?;
    }
    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
