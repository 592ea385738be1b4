//! Ledger-owned alert state

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::problem::{Problem, ProblemDetail, Severity};

/// Identifier of a message in the chat channel
pub type MessageId = i64;

/// Delivery state of an alert
///
/// Transitions only move forward: Active → Acknowledged → Resolved, or
/// Active → Resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertState {
    /// Status implied by a problem snapshot
    pub fn of(problem: &Problem) -> Self {
        if problem.is_resolved() {
            AlertState::Resolved
        } else if problem.acknowledged {
            AlertState::Acknowledged
        } else {
            AlertState::Active
        }
    }

    fn rank(self) -> u8 {
        match self {
            AlertState::Active => 0,
            AlertState::Acknowledged => 1,
            AlertState::Resolved => 2,
        }
    }

    pub fn can_transition_to(self, next: AlertState) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlertState::Active => "active",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(AlertState::Active),
            "acknowledged" => Ok(AlertState::Acknowledged),
            "resolved" => Ok(AlertState::Resolved),
            other => Err(format!("unknown alert state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid alert transition {from} -> {to}")]
pub struct TransitionError {
    pub from: AlertState,
    pub to: AlertState,
}

/// Tracked view of a delivered problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Same as the problem identifier
    pub id: String,
    pub state: AlertState,
    pub message_id: MessageId,
    /// Extra parts of a message that did not fit in one unit, in order
    #[serde(default)]
    pub follow_up_ids: Vec<MessageId>,
    pub severity: Severity,
    pub hostname: String,
    pub problem_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Opaque blob; holds the serialized `ProblemDetail` used for re-rendering
    pub metadata: serde_json::Value,
}

impl AlertRecord {
    /// Record for a problem whose first delivery just succeeded
    pub fn delivered(detail: &ProblemDetail, message_id: MessageId, now: DateTime<Utc>) -> Self {
        Self {
            id: detail.id().to_string(),
            state: AlertState::Active,
            message_id,
            follow_up_ids: Vec::new(),
            severity: detail.problem.severity,
            hostname: detail.hostname().to_string(),
            problem_name: detail.problem.name.clone(),
            created_at: now,
            updated_at: now,
            resolved_at: None,
            acknowledged_at: None,
            metadata: serde_json::to_value(detail).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Move to `next`, stamping the matching timestamp
    pub fn transition(&mut self, next: AlertState, at: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }

        match next {
            AlertState::Resolved => self.resolved_at = Some(at),
            AlertState::Acknowledged => self.acknowledged_at = Some(at),
            AlertState::Active => {}
        }
        self.state = next;
        self.updated_at = at;
        Ok(())
    }

    pub fn with_follow_ups(mut self, ids: Vec<MessageId>) -> Self {
        self.follow_up_ids = ids;
        self
    }

    /// Every chat message belonging to this alert, primary first
    pub fn message_ids(&self) -> Vec<MessageId> {
        std::iter::once(self.message_id)
            .chain(self.follow_up_ids.iter().copied())
            .collect()
    }

    /// Problem detail stored at delivery time, if the blob is intact
    pub fn detail(&self) -> Option<ProblemDetail> {
        serde_json::from_value(self.metadata.clone()).ok()
    }

    pub fn is_tracking(&self) -> bool {
        self.state != AlertState::Resolved
    }
}

/// A delivery waiting in the retry queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryItem {
    pub detail: ProblemDetail,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl RetryItem {
    /// Item for a delivery that has failed once
    pub fn first_failure(detail: ProblemDetail, now: DateTime<Utc>) -> Self {
        Self {
            detail,
            enqueued_at: now,
            attempts: 1,
        }
    }

    pub fn id(&self) -> &str {
        self.detail.id()
    }
}
