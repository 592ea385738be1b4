//! Read-only views of the running monitor
//!
//! The scheduler publishes a [`StatusSnapshot`] after every phase change and
//! tick; readers never touch the ledger itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;

use super::ledger::LedgerStats;
use super::scheduler::Phase;
use crate::delivery::DeliveryChannel;
use crate::model::AlertRecord;
use crate::source::ProblemSource;

/// Upper bound of active alerts carried in a snapshot
pub const ACTIVE_SNAPSHOT_LIMIT: usize = 50;

/// Point-in-time copy of monitor counters and ledger sizes
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub checks: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub reconnects: u64,
    pub problems_found: u64,
    pub alerts: LedgerStats,
    pub tracked_alerts: usize,
    pub retry_queue: usize,
    pub skipped_problems: usize,
    pub unsynced_records: usize,
    #[serde(skip)]
    pub active: Vec<AlertRecord>,
}

/// Snapshot plus live connectivity of both adapters
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    #[serde(flatten)]
    pub snapshot: StatusSnapshot,
    pub uptime_secs: i64,
    pub source_connected: bool,
    pub chat_connected: bool,
}

/// State shared between the scheduler and its handles
#[derive(Default)]
pub(crate) struct Shared {
    stop: AtomicBool,
    wake: Notify,
    pub(crate) status: RwLock<StatusSnapshot>,
}

impl Shared {
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Resolves when a stop is requested while sleeping, or was requested
    /// since the last call
    pub(crate) async fn stopped(&self) {
        self.wake.notified().await
    }
}

/// Cloneable read and control handle to a [`super::Monitor`]
#[derive(Clone)]
pub struct MonitorHandle {
    shared: Arc<Shared>,
    source: Arc<dyn ProblemSource>,
    channel: DeliveryChannel,
    probe_timeout: Duration,
}

impl MonitorHandle {
    pub(crate) fn new(
        shared: Arc<Shared>,
        source: Arc<dyn ProblemSource>,
        channel: DeliveryChannel,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            source,
            channel,
            probe_timeout,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.status.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.status.read().running
    }

    /// Snapshot with both adapters probed concurrently
    pub async fn status(&self) -> MonitorStatus {
        let snapshot = self.snapshot();

        let source_probe = async {
            matches!(
                tokio::time::timeout(self.probe_timeout, self.source.check_connection()).await,
                Ok(true)
            )
        };
        let (source_connected, chat_connected) =
            futures::join!(source_probe, self.channel.check_connection());

        let uptime_secs = snapshot
            .started_at
            .map(|started| (Utc::now() - started).num_seconds())
            .unwrap_or(0);

        MonitorStatus {
            snapshot,
            uptime_secs,
            source_connected,
            chat_connected,
        }
    }

    /// Currently unresolved alerts, most severe first
    pub fn active_problems(&self, limit: usize) -> Vec<AlertRecord> {
        self.shared
            .status
            .read()
            .active
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Ask the scheduler to exit after the current tick
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            tracing::info!("Monitor stop requested");
        }
        self.shared.wake.notify_one();
    }
}
