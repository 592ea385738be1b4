//! Durable SQLite store for alert history, audit events and daily counters
//!
//! Every call opens its own connection; every mutating call runs in a single
//! transaction that is rolled back on any failure.

pub mod schema;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::model::{AlertRecord, AlertState, Severity};

/// Daily counter names
pub mod metrics {
    pub const ALERTS_SENT: &str = "alerts_sent";
    pub const ALERTS_FAILED: &str = "alerts_failed";
    pub const ALERTS_RESOLVED: &str = "alerts_resolved";
    pub const PROBLEMS_FOUND: &str = "problems_found";
    pub const CHECKS: &str = "checks";
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Store task failed: {0}")]
    Background(#[from] tokio::task::JoinError),
}

/// Kind of lifecycle event written to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AlertSent,
    AlertQueued,
    AlertDropped,
    AlertAcknowledged,
    AlertResolved,
    AlertDeleted,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::AlertSent => "alert_sent",
            AuditKind::AlertQueued => "alert_queued",
            AuditKind::AlertDropped => "alert_dropped",
            AuditKind::AlertAcknowledged => "alert_acknowledged",
            AuditKind::AlertResolved => "alert_resolved",
            AuditKind::AlertDeleted => "alert_deleted",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "alert_sent" => AuditKind::AlertSent,
            "alert_queued" => AuditKind::AlertQueued,
            "alert_dropped" => AuditKind::AlertDropped,
            "alert_acknowledged" => AuditKind::AlertAcknowledged,
            "alert_resolved" => AuditKind::AlertResolved,
            "alert_deleted" => AuditKind::AlertDeleted,
            other => return Err(StoreError::Corrupted(format!("unknown event type '{}'", other))),
        })
    }
}

/// One audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub alert_id: Option<String>,
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, alert_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            alert_id: Some(alert_id.into()),
            details: None,
            timestamp: at,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Daily counter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: NaiveDate,
    pub metric: String,
    pub value: i64,
}

/// Aggregate view of the alert table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub total_alerts: i64,
    pub active_alerts: i64,
    pub acknowledged_alerts: i64,
    pub resolved_alerts: i64,
    /// Active alerts per severity
    pub severity_distribution: BTreeMap<u8, i64>,
}

/// Rows removed by an age-based prune
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub alerts: usize,
    pub events: usize,
}

const ALERT_COLUMNS: &str = "id, message_id, status, severity, hostname, problem_name, \
     created_at, updated_at, resolved_at, acknowledged_at, metadata, follow_up_ids";

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupted(format!("timestamp {} out of range", ms)))
}

/// Column values of one `alerts` row, before validation
struct AlertRow {
    id: String,
    message_id: i64,
    status: String,
    severity: i64,
    hostname: String,
    problem_name: String,
    created_at: i64,
    updated_at: i64,
    resolved_at: Option<i64>,
    acknowledged_at: Option<i64>,
    metadata: Option<String>,
    follow_up_ids: String,
}

impl AlertRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            message_id: row.get(1)?,
            status: row.get(2)?,
            severity: row.get(3)?,
            hostname: row.get(4)?,
            problem_name: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            resolved_at: row.get(8)?,
            acknowledged_at: row.get(9)?,
            metadata: row.get(10)?,
            follow_up_ids: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<AlertRecord, StoreError> {
        let state = self
            .status
            .parse::<AlertState>()
            .map_err(StoreError::Corrupted)?;
        let severity = u8::try_from(self.severity)
            .ok()
            .and_then(Severity::new)
            .ok_or_else(|| StoreError::Corrupted(format!("alert {} has severity {}", self.id, self.severity)))?;
        let metadata = match self.metadata {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        };
        let follow_up_ids = serde_json::from_str(&self.follow_up_ids)?;

        Ok(AlertRecord {
            id: self.id,
            state,
            message_id: self.message_id,
            follow_up_ids,
            severity,
            hostname: self.hostname,
            problem_name: self.problem_name,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            resolved_at: self.resolved_at.map(from_millis).transpose()?,
            acknowledged_at: self.acknowledged_at.map(from_millis).transpose()?,
            metadata,
        })
    }
}

fn upsert_alert_inner(conn: &Connection, record: &AlertRecord) -> Result<(), StoreError> {
    let metadata = if record.metadata.is_null() {
        None
    } else {
        Some(serde_json::to_string(&record.metadata)?)
    };
    let follow_up_ids = serde_json::to_string(&record.follow_up_ids)?;

    conn.execute(
        "INSERT INTO alerts (
            id, message_id, status, severity, hostname, problem_name,
            created_at, updated_at, resolved_at, acknowledged_at, metadata, follow_up_ids
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO UPDATE SET
            message_id = excluded.message_id,
            follow_up_ids = excluded.follow_up_ids,
            status = excluded.status,
            updated_at = excluded.updated_at,
            resolved_at = excluded.resolved_at,
            acknowledged_at = excluded.acknowledged_at,
            metadata = excluded.metadata",
        params![
            record.id,
            record.message_id,
            record.state.as_str(),
            record.severity.value(),
            record.hostname,
            record.problem_name,
            to_millis(record.created_at),
            to_millis(record.updated_at),
            record.resolved_at.map(to_millis),
            record.acknowledged_at.map(to_millis),
            metadata,
            follow_up_ids,
        ],
    )?;
    Ok(())
}

fn log_event_inner(conn: &Connection, event: &AuditEvent) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO events (event_type, alert_id, details, timestamp) VALUES (?1, ?2, ?3, ?4)",
        params![
            event.kind.as_str(),
            event.alert_id,
            event.details,
            to_millis(event.timestamp),
        ],
    )?;
    Ok(())
}

/// SQLite-backed alert store
#[derive(Debug, Clone)]
pub struct AlertStore {
    path: PathBuf,
}

impl AlertStore {
    /// Open (creating if needed) the database at `path` and apply the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let store = Self { path };
        store.transaction(schema::migrate)?;
        tracing::info!(path = %store.path.display(), "Alert store initialized");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run blocking store work on the blocking thread pool
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&AlertStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        schema::apply_pragmas(&conn)?;
        Ok(conn)
    }

    /// Run `f` inside a transaction on a fresh connection
    fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::error!(error = %rollback, "Rollback failed");
                }
                tracing::error!(error = %e, "Store transaction rolled back");
                Err(e)
            }
        }
    }

    /// Insert or update an alert keyed by id
    pub fn upsert_alert(&self, record: &AlertRecord) -> Result<(), StoreError> {
        self.transaction(|conn| upsert_alert_inner(conn, record))
    }

    /// Upsert an alert and append its audit event atomically
    pub fn save_alert(&self, record: &AlertRecord, event: &AuditEvent) -> Result<(), StoreError> {
        self.transaction(|conn| {
            upsert_alert_inner(conn, record)?;
            log_event_inner(conn, event)
        })
    }

    pub fn get_alert(&self, id: &str) -> Result<Option<AlertRecord>, StoreError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
                params![id],
                AlertRow::read,
            )
            .optional()?;
        row.map(AlertRow::into_record).transpose()
    }

    /// Alerts in `state`, newest first
    pub fn list_by_state(&self, state: AlertState, limit: usize) -> Result<Vec<AlertRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM alerts WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
            ALERT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![state.as_str(), limit as i64], AlertRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AlertRow::into_record).collect()
    }

    /// Delete alerts created and audit events logged before `cutoff`
    pub fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<PruneReport, StoreError> {
        let cutoff = to_millis(cutoff);
        let report = self.transaction(|conn| {
            let alerts = conn.execute("DELETE FROM alerts WHERE created_at < ?1", params![cutoff])?;
            let events = conn.execute("DELETE FROM events WHERE timestamp < ?1", params![cutoff])?;
            Ok(PruneReport { alerts, events })
        })?;

        if report.alerts > 0 || report.events > 0 {
            tracing::info!(alerts = report.alerts, events = report.events, "Pruned old history");
        }
        Ok(report)
    }

    pub fn log_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.transaction(|conn| log_event_inner(conn, event))
    }

    /// Most recent audit events, newest first
    pub fn recent_events(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, alert_id, details, timestamp FROM events
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(kind, alert_id, details, ts)| {
                Ok(AuditEvent {
                    kind: kind.parse()?,
                    alert_id,
                    details,
                    timestamp: from_millis(ts)?,
                })
            })
            .collect()
    }

    /// Add `by` to the counter `metric` for `date`
    pub fn increment_stat(&self, metric: &str, by: i64, date: NaiveDate) -> Result<(), StoreError> {
        self.transaction(|conn| {
            conn.execute(
                "INSERT INTO statistics (date, metric_name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(date, metric_name) DO UPDATE SET value = value + excluded.value",
                params![date.to_string(), metric, by],
            )?;
            Ok(())
        })
    }

    /// Sum of `metric` over `from..=to`
    pub fn sum_stat(&self, metric: &str, from: NaiveDate, to: NaiveDate) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(value), 0) FROM statistics
             WHERE metric_name = ?1 AND date >= ?2 AND date <= ?3",
            params![metric, from.to_string(), to.to_string()],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Per-day values of `metric` since `from`, newest first
    pub fn daily_stats(&self, metric: &str, from: NaiveDate) -> Result<Vec<DailyStat>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT date, value FROM statistics
             WHERE metric_name = ?1 AND date >= ?2 ORDER BY date DESC",
        )?;
        let rows = stmt
            .query_map(params![metric, from.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(date, value)| {
                let date = date
                    .parse::<NaiveDate>()
                    .map_err(|e| StoreError::Corrupted(format!("bad date '{}': {}", date, e)))?;
                Ok(DailyStat {
                    date,
                    metric: metric.to_string(),
                    value,
                })
            })
            .collect()
    }

    pub fn summary(&self) -> Result<StoreSummary, StoreError> {
        let conn = self.connect()?;
        let mut summary = StoreSummary::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM alerts GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (status, count) in counts {
            summary.total_alerts += count;
            match status.parse::<AlertState>() {
                Ok(AlertState::Active) => summary.active_alerts = count,
                Ok(AlertState::Acknowledged) => summary.acknowledged_alerts = count,
                Ok(AlertState::Resolved) => summary.resolved_alerts = count,
                Err(e) => return Err(StoreError::Corrupted(e)),
            }
        }

        let mut stmt = conn.prepare(
            "SELECT severity, COUNT(*) FROM alerts WHERE status = ?1 GROUP BY severity",
        )?;
        let rows = stmt
            .query_map(params![AlertState::Active.as_str()], |row| {
                Ok((row.get::<_, u8>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        summary.severity_distribution = rows.into_iter().collect();

        Ok(summary)
    }
}
