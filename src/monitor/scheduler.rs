//! Polling scheduler
//!
//! One cooperative loop drives the whole pipeline. Each tick walks the
//! phases in a fixed order:
//!
//! ```text
//! Sleeping -> Polling -> Reconciling -> Retrying -> Evicting -> Sleeping
//! ```
//!
//! A failure in any phase ends the tick early, is counted, and triggers a
//! source reconnect when the source was at fault. Only a stop request ends
//! the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, SubsecRound, Utc};
use serde::Serialize;

use super::ledger::{Admission, Ledger, LedgerConfig, RetryReport};
use super::status::{MonitorHandle, Shared, StatusSnapshot, ACTIVE_SNAPSHOT_LIMIT};
use crate::delivery::DeliveryChannel;
use crate::filter::FilterConfig;
use crate::model::Problem;
use crate::source::{ProblemSource, SourceError};
use crate::store::{metrics, AlertStore, StoreError};

/// Scheduler settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Problems fetched per tick
    pub page_size: usize,
    /// Bound on source calls made by the scheduler
    pub request_timeout: Duration,
    /// Store history older than this is pruned daily; zero keeps everything
    pub retention: Duration,
    pub ledger: LedgerConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            page_size: 50,
            request_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(30 * 24 * 3600),
            ledger: LedgerConfig::default(),
        }
    }
}

/// Tick-level failures
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Source unavailable: {0}")]
    Source(#[from] SourceError),

    #[error("Persistence failed: {0}")]
    Store(#[from] StoreError),
}

impl MonitorError {
    pub fn needs_reconnect(&self) -> bool {
        matches!(self, MonitorError::Source(_))
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Polling,
    Reconciling,
    Retrying,
    Evicting,
    #[default]
    Sleeping,
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub admitted: usize,
    pub delivered: usize,
    pub transitions: usize,
    pub retry: RetryReport,
    pub cleaned: usize,
    pub evicted: usize,
    pub synced: usize,
}

const PRUNE_INTERVAL_HOURS: i64 = 24;

/// Source clocks have whole-second resolution; a problem raised later in
/// the same second as a tick start must still be a candidate
fn watermark(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(0)
}

pub struct Monitor {
    config: MonitorConfig,
    source: Arc<dyn ProblemSource>,
    channel: DeliveryChannel,
    store: Option<AlertStore>,
    ledger: Ledger,
    shared: Arc<Shared>,
    status: StatusSnapshot,
    last_check: DateTime<Utc>,
    last_prune: Option<DateTime<Utc>>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        filter: FilterConfig,
        source: Arc<dyn ProblemSource>,
        channel: DeliveryChannel,
        store: Option<AlertStore>,
    ) -> Self {
        let ledger = Ledger::new(
            config.ledger.clone(),
            filter,
            Arc::clone(&source),
            channel.clone(),
            store.clone(),
        );
        let interval = chrono::Duration::from_std(config.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let last_check = watermark(Utc::now() - interval);

        Self {
            config,
            source,
            channel,
            store,
            ledger,
            shared: Arc::new(Shared::default()),
            status: StatusSnapshot::default(),
            last_check,
            last_prune: None,
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.source),
            self.channel.clone(),
            self.config.request_timeout,
        )
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn last_check(&self) -> DateTime<Utc> {
        self.last_check
    }

    /// Run until [`MonitorHandle::stop`] is called
    pub async fn run(mut self) {
        tracing::info!(
            source = self.source.name(),
            transport = self.channel.transport().name(),
            interval = ?self.config.poll_interval,
            "Monitor started"
        );
        self.status.running = true;
        self.status.started_at = Some(Utc::now());
        self.publish();

        while !self.shared.stop_requested() {
            self.step().await;

            self.set_phase(Phase::Sleeping);
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.shared.stopped() => {}
            }
        }

        self.status.running = false;
        self.publish();
        tracing::info!(checks = self.status.checks, errors = self.status.errors, "Monitor stopped");
    }

    /// One tick with failure accounting; the loop body of [`Monitor::run`]
    pub async fn step(&mut self) -> Option<TickReport> {
        let outcome = self.tick().await;
        let report = match outcome {
            Ok(report) => {
                tracing::debug!(?report, "Tick complete");
                Some(report)
            }
            Err(e) => {
                self.status.errors += 1;
                self.status.last_error = Some(e.to_string());
                tracing::error!(phase = ?self.status.phase, error = %e, "Monitor tick failed");
                if e.needs_reconnect() {
                    self.reconnect().await;
                }
                None
            }
        };
        self.publish();
        report
    }

    /// Run every phase once, in order, stopping at the first failure
    pub async fn tick(&mut self) -> Result<TickReport, MonitorError> {
        let now = Utc::now();
        let local_time = Local::now().time();
        let mut report = TickReport::default();

        self.status.checks += 1;
        self.bump(metrics::CHECKS, 1, now).await;
        report.synced = self.ledger.sync_pending().await;

        self.set_phase(Phase::Polling);
        let problems = self.fetch_problems().await?;
        report.fetched = problems.len();

        for problem in &problems {
            if !self.ledger.is_candidate(problem, self.last_check) {
                continue;
            }
            report.admitted += 1;
            if let Admission::Delivered(_) = self.ledger.admit(problem, now, local_time).await {
                report.delivered += 1;
            }
        }
        if report.admitted > 0 {
            tracing::info!(new = report.admitted, delivered = report.delivered, "New problems found");
            self.status.problems_found += report.admitted as u64;
            self.bump(metrics::PROBLEMS_FOUND, report.admitted as i64, now).await;
        }

        self.set_phase(Phase::Reconciling);
        report.transitions = self.ledger.reconcile(now).await?;

        self.set_phase(Phase::Retrying);
        report.retry = self.ledger.flush_retry_queue(now).await;
        report.cleaned = self.ledger.cleanup_resolved(now).await;

        self.set_phase(Phase::Evicting);
        report.evicted = self.ledger.evict_stale(now);
        self.prune_history(now).await?;

        self.last_check = watermark(now);
        self.status.last_check = Some(now);
        Ok(report)
    }

    async fn fetch_problems(&self) -> Result<Vec<Problem>, SourceError> {
        let fetch = self.source.fetch_problems(self.config.page_size);
        match tokio::time::timeout(self.config.request_timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout),
        }
    }

    async fn reconnect(&mut self) -> bool {
        self.status.reconnects += 1;
        let probe = self.source.check_connection();
        let connected = matches!(tokio::time::timeout(self.config.request_timeout, probe).await, Ok(true));

        if connected {
            tracing::info!(source = self.source.name(), "Source reconnected");
        } else {
            tracing::warn!(source = self.source.name(), "Source still unreachable");
        }
        connected
    }

    /// Age-based store delete, at most once a day
    async fn prune_history(&mut self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if self.config.retention.is_zero() {
            return Ok(());
        }
        if let Some(last) = self.last_prune {
            if now - last < chrono::Duration::hours(PRUNE_INTERVAL_HOURS) {
                return Ok(());
            }
        }

        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = now - retention;
        store.call(move |s| s.delete_older_than(cutoff)).await?;
        self.last_prune = Some(now);
        Ok(())
    }

    async fn bump(&self, metric: &'static str, by: i64, now: DateTime<Utc>) {
        if let Some(store) = &self.store {
            let date = now.date_naive();
            if let Err(e) = store.call(move |s| s.increment_stat(metric, by, date)).await {
                tracing::error!(metric, error = %e, "Failed to update counter");
            }
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.status.phase = phase;
        self.shared.status.write().phase = phase;
    }

    fn publish(&self) {
        let mut snapshot = self.status.clone();
        snapshot.alerts = self.ledger.stats();
        snapshot.tracked_alerts = self.ledger.len();
        snapshot.retry_queue = self.ledger.retry_len();
        snapshot.skipped_problems = self.ledger.skipped_len();
        snapshot.unsynced_records = self.ledger.unsynced_len();
        snapshot.active = self.ledger.active_alerts(ACTIVE_SNAPSHOT_LIMIT);
        *self.shared.status.write() = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::{instant_channel, Fail, FakeTransport};
    use crate::model::{AlertState, Host, Severity};
    use crate::source::testing::FakeSource;
    use crate::store::AuditKind;
    use tempfile::TempDir;

    fn problem(id: &str, severity: Severity, age: chrono::Duration) -> Problem {
        Problem::new(id, "Service unavailable", severity, Utc::now() - age)
            .with_host(Host::new("1", "web01"))
    }

    fn fresh(id: &str) -> Problem {
        problem(id, Severity::HIGH, chrono::Duration::seconds(5))
    }

    fn monitor(source: &Arc<FakeSource>, transport: &Arc<FakeTransport>) -> Monitor {
        Monitor::new(
            MonitorConfig::default(),
            FilterConfig::default(),
            source.clone(),
            instant_channel(transport.clone(), 1),
            None,
        )
    }

    #[tokio::test]
    async fn test_tick_delivers_new_problem_once() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        source.set_problems(vec![fresh("1")]);
        let mut monitor = monitor(&source, &transport);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(report.delivered, 1);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(transport.sends().len(), 1);
        assert_eq!(monitor.ledger().get("1").unwrap().state, AlertState::Active);
    }

    #[tokio::test]
    async fn test_problem_older_than_last_check_is_ignored() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        source.set_problems(vec![problem("1", Severity::HIGH, chrono::Duration::hours(2))]);
        let mut monitor = monitor(&source, &transport);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.admitted, 0);
        assert!(transport.sends().is_empty());
    }

    #[tokio::test]
    async fn test_problem_in_tick_start_second_is_delivered() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        let mut monitor = monitor(&source, &transport);
        monitor.tick().await.unwrap();

        let watermark = monitor.last_check();
        assert_eq!(watermark.timestamp_subsec_nanos(), 0);
        let same_second = Problem::new("9", "Link down", Severity::HIGH, watermark)
            .with_host(Host::new("1", "web01"));
        source.set_problems(vec![same_second]);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.delivered, 1);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(transport.sends().len(), 1);
    }

    #[tokio::test]
    async fn test_resolution_edits_message() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        let p = fresh("1");
        source.set_problems(vec![p.clone()]);
        let mut monitor = monitor(&source, &transport);
        monitor.tick().await.unwrap();

        source.update_event(p.resolved(Utc::now()));
        let report = monitor.tick().await.unwrap();
        assert_eq!(report.transitions, 1);
        assert_eq!(transport.edits().len(), 1);
        assert_eq!(monitor.ledger().get("1").unwrap().state, AlertState::Resolved);
    }

    #[tokio::test]
    async fn test_failed_send_retried_next_tick() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        transport.fail_sends(1, Fail::Api);
        source.set_problems(vec![fresh("1")]);
        let mut monitor = monitor(&source, &transport);

        monitor.tick().await.unwrap();
        assert_eq!(monitor.ledger().retry_len(), 1);
        assert_eq!(monitor.ledger().retry_queue()[0].attempts, 1);

        let report = monitor.tick().await.unwrap();
        assert_eq!(report.retry.delivered, 1);
        assert_eq!(monitor.ledger().retry_len(), 0);
        assert_eq!(monitor.ledger().get("1").unwrap().state, AlertState::Active);
    }

    #[tokio::test]
    async fn test_source_failure_counts_and_reconnects() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        source.set_problems(vec![fresh("1")]);
        source.set_failing(true);
        let mut monitor = monitor(&source, &transport);
        let handle = monitor.handle();
        let before = monitor.last_check();

        assert!(monitor.step().await.is_none());
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.reconnects, 1);
        assert!(snapshot.last_error.unwrap().contains("Source unavailable"));
        assert_eq!(*source.connection_checks.lock(), 1);
        assert_eq!(monitor.last_check(), before);

        source.set_failing(false);
        let report = monitor.step().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(handle.snapshot().checks, 2);
    }

    #[tokio::test]
    async fn test_snapshot_lists_active_problems() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        source.set_problems(vec![
            problem("1", Severity::AVERAGE, chrono::Duration::seconds(5)),
            problem("2", Severity::DISASTER, chrono::Duration::seconds(5)),
        ]);
        let mut monitor = monitor(&source, &transport);
        let handle = monitor.handle();

        monitor.step().await.unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.tracked_alerts, 2);
        assert_eq!(snapshot.alerts.alerts_sent, 2);

        let active = handle.active_problems(1);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "2");
    }

    #[tokio::test]
    async fn test_status_checks_both_adapters() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        let monitor = monitor(&source, &transport);

        let status = monitor.handle().status().await;
        assert!(status.source_connected);
        assert!(status.chat_connected);
        assert!(!status.snapshot.running);
    }

    #[tokio::test]
    async fn test_stop_ends_run_loop() {
        let source = FakeSource::new();
        let transport = FakeTransport::new();
        let monitor = monitor(&source, &transport);
        let handle = monitor.handle();

        let task = tokio::spawn(monitor.run());
        tokio::task::yield_now().await;
        handle.stop();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_tick_records_history_and_prunes() {
        let dir = TempDir::new().unwrap();
        let store = AlertStore::open(dir.path().join("alerts.db")).unwrap();
        store
            .log_event(&crate::store::AuditEvent::new(
                AuditKind::AlertSent,
                "ancient",
                Utc::now() - chrono::Duration::days(90),
            ))
            .unwrap();

        let source = FakeSource::new();
        let transport = FakeTransport::new();
        source.set_problems(vec![fresh("1")]);
        let mut monitor = Monitor::new(
            MonitorConfig::default(),
            FilterConfig::default(),
            source.clone(),
            instant_channel(transport.clone(), 1),
            Some(store.clone()),
        );

        monitor.tick().await.unwrap();

        let events = store.recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].alert_id.as_deref(), Some("1"));

        let today = Utc::now().date_naive();
        assert_eq!(store.sum_stat(metrics::CHECKS, today, today).unwrap(), 1);
        assert_eq!(store.sum_stat(metrics::PROBLEMS_FOUND, today, today).unwrap(), 1);
        assert!(store.get_alert("1").unwrap().is_some());
    }
}
