//! Alert ledger and retry queue
//!
//! The ledger is the only writer of alert state. Every delivery, status edit,
//! cleanup and eviction goes through it; the store only ever receives
//! mirrored copies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;

use crate::delivery::{render_alert, DeliveryChannel, DeliveryError, Posted};
use crate::filter::{self, FilterConfig, FilterDecision};
use crate::model::{AlertRecord, AlertState, MessageId, Problem, ProblemDetail, RetryItem, Severity};
use crate::source::{ProblemSource, SourceError};
use crate::store::{metrics, AlertStore, AuditEvent, AuditKind};

/// Ledger behaviour settings
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Attempt count at which a queued delivery is dropped
    pub max_retry_attempts: u32,
    /// Age of a resolved alert before cleanup; zero disables cleanup
    pub delete_resolved_after: Duration,
    /// Leave resolved messages in the chat instead of deleting them
    pub mark_resolved: bool,
    /// Base URL of the source UI, used for "open" links
    pub source_url: Option<String>,
    /// Ledger size above which stale entries are evicted
    pub eviction_threshold: usize,
    /// Entries older than this are stale
    pub eviction_age: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 5,
            delete_resolved_after: Duration::from_secs(3600),
            mark_resolved: true,
            source_url: None,
            eviction_threshold: 1000,
            eviction_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Outcome of admitting one problem
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Already tracked or waiting in the retry queue
    Tracked,
    /// Rejected earlier at the same or a higher severity
    Skipped,
    Filtered(FilterDecision),
    Delivered(MessageId),
    Queued,
    Dropped,
}

/// Result of one retry-queue flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    pub alerts_acknowledged: u64,
    pub alerts_resolved: u64,
    pub alerts_dropped: u64,
    pub alerts_deleted: u64,
}

/// A problem the filter rejected, remembered so it is not re-evaluated
/// unless its severity rises
#[derive(Debug, Clone, Copy)]
struct Skipped {
    severity: Severity,
    at: DateTime<Utc>,
}

fn age_limit(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

pub struct Ledger {
    config: LedgerConfig,
    filter: FilterConfig,
    source: Arc<dyn ProblemSource>,
    channel: DeliveryChannel,
    store: Option<AlertStore>,
    records: HashMap<String, AlertRecord>,
    retry_queue: Vec<RetryItem>,
    skipped: HashMap<String, Skipped>,
    /// Records whose last mirror write failed
    unsynced: HashMap<String, AlertRecord>,
    stats: LedgerStats,
}

impl Ledger {
    pub fn new(
        config: LedgerConfig,
        filter: FilterConfig,
        source: Arc<dyn ProblemSource>,
        channel: DeliveryChannel,
        store: Option<AlertStore>,
    ) -> Self {
        Self {
            config,
            filter,
            source,
            channel,
            store,
            records: HashMap::new(),
            retry_queue: Vec::new(),
            skipped: HashMap::new(),
            unsynced: HashMap::new(),
            stats: LedgerStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn retry_len(&self) -> usize {
        self.retry_queue.len()
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    pub fn unsynced_len(&self) -> usize {
        self.unsynced.len()
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats
    }

    pub fn get(&self, id: &str) -> Option<&AlertRecord> {
        self.records.get(id)
    }

    pub fn retry_queue(&self) -> &[RetryItem] {
        &self.retry_queue
    }

    /// Tracked or queued for retry
    pub fn is_known(&self, id: &str) -> bool {
        self.records.contains_key(id) || self.retry_queue.iter().any(|item| item.id() == id)
    }

    /// Whether `problem` should go through admission this tick
    pub fn is_candidate(&self, problem: &Problem, last_check: DateTime<Utc>) -> bool {
        if self.is_known(&problem.id) {
            return false;
        }
        match self.skipped.get(&problem.id) {
            Some(skipped) => problem.severity > skipped.severity,
            None => problem.created_at >= last_check,
        }
    }

    /// Unresolved alerts, most severe first, then newest first
    pub fn active_alerts(&self, limit: usize) -> Vec<AlertRecord> {
        let mut active: Vec<&AlertRecord> = self.records.values().filter(|r| r.is_tracking()).collect();
        active.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        active.into_iter().take(limit).cloned().collect()
    }

    /// Filter, enrich and deliver a problem seen for the first time.
    ///
    /// `local_time` is the wall-clock time of day used for quiet hours.
    pub async fn admit(
        &mut self,
        problem: &Problem,
        now: DateTime<Utc>,
        local_time: NaiveTime,
    ) -> Admission {
        if self.is_known(&problem.id) {
            return Admission::Tracked;
        }
        if let Some(skipped) = self.skipped.get(&problem.id) {
            if problem.severity <= skipped.severity {
                return Admission::Skipped;
            }
        }

        let decision = filter::evaluate(problem, &self.filter, local_time);
        if !decision.passes() {
            tracing::debug!(problem_id = %problem.id, ?decision, "Problem filtered out");
            self.skipped.insert(
                problem.id.clone(),
                Skipped {
                    severity: problem.severity,
                    at: now,
                },
            );
            return Admission::Filtered(decision);
        }
        self.skipped.remove(&problem.id);

        let detail = match self.source.fetch_problem_detail(problem).await {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(
                    problem_id = %problem.id,
                    error = %e,
                    "Problem detail unavailable, rendering from snapshot"
                );
                ProblemDetail::from_problem(problem.clone())
            }
        };

        match self.deliver(&detail).await {
            Ok(posted) => {
                let message_id = posted.message_id;
                self.record_delivery(detail, posted, now).await;
                Admission::Delivered(message_id)
            }
            Err(e) => {
                tracing::warn!(problem_id = %problem.id, error = %e, "Delivery failed, queueing for retry");
                self.stats.alerts_failed += 1;
                self.bump(metrics::ALERTS_FAILED, now).await;
                self.requeue_or_drop(RetryItem::first_failure(detail, now), now).await
            }
        }
    }

    /// Re-query every unresolved alert and move it forward when the source
    /// reports acknowledgement or resolution.
    ///
    /// The state only changes once the chat message edit succeeds; a failed
    /// edit is retried on the next call. Returns the number of transitions.
    pub async fn reconcile(&mut self, now: DateTime<Utc>) -> Result<usize, SourceError> {
        let ids: Vec<String> = self
            .records
            .values()
            .filter(|r| r.is_tracking())
            .map(|r| r.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let latest = self.source.fetch_events(&ids).await?;
        let mut changed = 0;

        for problem in latest {
            let Some(current) = self.records.get(&problem.id) else {
                continue;
            };
            let target = AlertState::of(&problem);
            if !current.state.can_transition_to(target) {
                continue;
            }

            let mut record = current.clone();
            let mut detail = record
                .detail()
                .unwrap_or_else(|| ProblemDetail::from_problem(problem.clone()));
            detail.refresh_status(&problem);

            let (text, controls) = render_alert(&detail, self.config.source_url.as_deref());
            let edited = self
                .channel
                .edit(record.message_id, &record.follow_up_ids, &text, controls.as_ref())
                .await;
            match edited {
                Ok(follow_ups) => record.follow_up_ids = follow_ups,
                Err(e) => {
                    tracing::warn!(
                        problem_id = %record.id,
                        message_id = record.message_id,
                        error = %e,
                        "Status edit failed, will retry next tick"
                    );
                    continue;
                }
            }

            if let Err(e) = record.transition(target, now) {
                tracing::error!(problem_id = %record.id, error = %e, "Rejected state change");
                continue;
            }
            if let Ok(metadata) = serde_json::to_value(&detail) {
                record.metadata = metadata;
            }

            let kind = match target {
                AlertState::Resolved => {
                    self.stats.alerts_resolved += 1;
                    AuditKind::AlertResolved
                }
                _ => {
                    self.stats.alerts_acknowledged += 1;
                    AuditKind::AlertAcknowledged
                }
            };
            tracing::info!(
                problem_id = %record.id,
                message_id = record.message_id,
                state = %target,
                "Alert status updated"
            );

            let event = AuditEvent::new(kind, &record.id, now);
            self.records.insert(record.id.clone(), record.clone());
            self.mirror(record, event).await;
            if target == AlertState::Resolved {
                self.bump(metrics::ALERTS_RESOLVED, now).await;
            }
            changed += 1;
        }

        Ok(changed)
    }

    /// Attempt every delivery queued before `now` once; items queued at
    /// `now` wait for the next tick
    pub async fn flush_retry_queue(&mut self, now: DateTime<Utc>) -> RetryReport {
        let mut report = RetryReport::default();

        for mut item in std::mem::take(&mut self.retry_queue) {
            if item.enqueued_at >= now {
                self.retry_queue.push(item);
                continue;
            }

            match self.deliver(&item.detail).await {
                Ok(posted) => {
                    tracing::info!(problem_id = %item.id(), attempts = item.attempts, "Queued alert delivered");
                    self.record_delivery(item.detail, posted, now).await;
                    report.delivered += 1;
                }
                Err(e) => {
                    item.attempts += 1;
                    tracing::warn!(
                        problem_id = %item.id(),
                        attempts = item.attempts,
                        error = %e,
                        "Retry delivery failed"
                    );
                    self.stats.alerts_failed += 1;
                    self.bump(metrics::ALERTS_FAILED, now).await;
                    match self.requeue_or_drop(item, now).await {
                        Admission::Dropped => report.dropped += 1,
                        _ => report.requeued += 1,
                    }
                }
            }
        }

        report
    }

    /// Delete chat messages of alerts resolved longer than the grace period.
    ///
    /// Does nothing in mark-only mode or when the grace period is zero.
    pub async fn cleanup_resolved(&mut self, now: DateTime<Utc>) -> usize {
        if self.config.mark_resolved || self.config.delete_resolved_after.is_zero() {
            return 0;
        }

        let grace = age_limit(self.config.delete_resolved_after);
        let due: Vec<(String, Vec<MessageId>)> = self
            .records
            .values()
            .filter(|r| r.state == AlertState::Resolved)
            .filter(|r| now - r.resolved_at.unwrap_or(r.updated_at) >= grace)
            .map(|r| (r.id.clone(), r.message_ids()))
            .collect();

        let mut removed = 0;
        'alerts: for (id, message_ids) in due {
            // Parts already gone count as deleted, so a retry can start over
            for &message_id in &message_ids {
                if let Err(e) = self.channel.delete(message_id).await {
                    tracing::warn!(problem_id = %id, message_id, error = %e, "Cleanup delete failed");
                    continue 'alerts;
                }
            }

            self.records.remove(&id);
            self.stats.alerts_deleted += 1;
            tracing::info!(problem_id = %id, parts = message_ids.len(), "Resolved alert cleaned up");
            self.audit(
                AuditEvent::new(AuditKind::AlertDeleted, &id, now)
                    .with_details(format!("messages {:?}", message_ids)),
            )
            .await;
            removed += 1;
        }

        removed
    }

    /// Once the ledger exceeds its size threshold, forget entries of any
    /// state older than the eviction age. The store keeps them.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> usize {
        let max_age = age_limit(self.config.eviction_age);
        let threshold = self.config.eviction_threshold;
        let mut evicted = 0;

        if self.records.len() > threshold {
            let before = self.records.len();
            self.records.retain(|_, r| now - r.created_at <= max_age);
            evicted = before - self.records.len();
        }
        if self.skipped.len() > threshold {
            self.skipped.retain(|_, s| now - s.at <= max_age);
        }

        if evicted > 0 {
            tracing::info!(evicted, remaining = self.records.len(), "Evicted stale ledger entries");
        }
        evicted
    }

    /// Re-write records whose previous mirror write failed
    pub async fn sync_pending(&mut self) -> usize {
        let Some(store) = self.store.clone() else {
            return 0;
        };

        let pending: Vec<AlertRecord> = self.unsynced.values().cloned().collect();
        let mut synced = 0;
        for record in pending {
            let id = record.id.clone();
            match store.call(move |s| s.upsert_alert(&record)).await {
                Ok(()) => {
                    self.unsynced.remove(&id);
                    synced += 1;
                }
                Err(e) => {
                    tracing::error!(problem_id = %id, error = %e, "Alert mirror still failing");
                    break;
                }
            }
        }
        synced
    }

    async fn deliver(&self, detail: &ProblemDetail) -> Result<Posted, DeliveryError> {
        let (text, controls) = render_alert(detail, self.config.source_url.as_deref());
        self.channel.send(&text, controls.as_ref()).await
    }

    async fn record_delivery(&mut self, detail: ProblemDetail, posted: Posted, now: DateTime<Utc>) {
        let message_id = posted.message_id;
        let record = AlertRecord::delivered(&detail, message_id, now).with_follow_ups(posted.follow_ups);
        tracing::info!(
            problem_id = %record.id,
            message_id,
            parts = record.follow_up_ids.len() + 1,
            severity = %record.severity,
            host = %record.hostname,
            "Alert delivered"
        );
        self.stats.alerts_sent += 1;

        let event = AuditEvent::new(AuditKind::AlertSent, &record.id, now)
            .with_details(format!("message {}", message_id));
        self.records.insert(record.id.clone(), record.clone());
        self.mirror(record, event).await;
        self.bump(metrics::ALERTS_SENT, now).await;
    }

    async fn requeue_or_drop(&mut self, item: RetryItem, now: DateTime<Utc>) -> Admission {
        if item.attempts >= self.config.max_retry_attempts {
            tracing::warn!(
                problem_id = %item.id(),
                attempts = item.attempts,
                "Retry limit reached, dropping alert"
            );
            self.stats.alerts_dropped += 1;
            self.audit(
                AuditEvent::new(AuditKind::AlertDropped, item.id(), now)
                    .with_details(format!("after {} attempts", item.attempts)),
            )
            .await;
            return Admission::Dropped;
        }

        self.audit(
            AuditEvent::new(AuditKind::AlertQueued, item.id(), now)
                .with_details(format!("attempt {}", item.attempts)),
        )
        .await;
        self.retry_queue.push(item);
        Admission::Queued
    }

    async fn mirror(&mut self, record: AlertRecord, event: AuditEvent) {
        let Some(store) = &self.store else {
            return;
        };

        let id = record.id.clone();
        let pending = record.clone();
        match store.call(move |s| s.save_alert(&record, &event)).await {
            Ok(()) => {
                self.unsynced.remove(&id);
            }
            Err(e) => {
                tracing::error!(problem_id = %id, error = %e, "Failed to persist alert, will retry");
                self.unsynced.insert(id, pending);
            }
        }
    }

    async fn audit(&self, event: AuditEvent) {
        if let Some(store) = &self.store {
            if let Err(e) = store.call(move |s| s.log_event(&event)).await {
                tracing::error!(error = %e, "Failed to write audit event");
            }
        }
    }

    async fn bump(&self, metric: &'static str, now: DateTime<Utc>) {
        if let Some(store) = &self.store {
            let date = now.date_naive();
            if let Err(e) = store.call(move |s| s.increment_stat(metric, 1, date)).await {
                tracing::error!(metric, error = %e, "Failed to update counter");
            }
        }
    }
}
