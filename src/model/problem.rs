//! Upstream problem snapshots

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Problem severity, an ordinal in `0..=5`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Severity(u8);

impl Severity {
    pub const NOT_CLASSIFIED: Severity = Severity(0);
    pub const INFORMATION: Severity = Severity(1);
    pub const WARNING: Severity = Severity(2);
    pub const AVERAGE: Severity = Severity(3);
    pub const HIGH: Severity = Severity(4);
    pub const DISASTER: Severity = Severity(5);

    /// Highest valid ordinal
    pub const MAX: u8 = 5;

    /// Create a severity, rejecting values outside `0..=5`
    pub fn new(value: u8) -> Option<Self> {
        (value <= Self::MAX).then_some(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Human-readable label
    pub fn label(self) -> &'static str {
        match self.0 {
            0 => "Not classified",
            1 => "Information",
            2 => "Warning",
            3 => "Average",
            4 => "High",
            _ => "Disaster",
        }
    }

    /// Marker shown in front of the label in chat messages
    pub fn icon(self) -> &'static str {
        match self.0 {
            0 => "⚪",
            1 => "🔵",
            2 => "🟡",
            3 => "🟠",
            4 => "🔴",
            _ => "🔥",
        }
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Severity::new(value).ok_or_else(|| format!("severity {} out of range 0-5", value))
    }
}

impl From<Severity> for u8 {
    fn from(severity: Severity) -> Self {
        severity.0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monitored host affected by a problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    /// Technical host name, matched by the deny-list
    pub name: String,
    /// Display name
    pub visible_name: String,
    /// Names of the host groups this host belongs to
    #[serde(default)]
    pub groups: Vec<String>,
    /// First interface address, when known
    #[serde(default)]
    pub address: Option<String>,
}

impl Host {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            visible_name: name.clone(),
            name,
            groups: Vec::new(),
            address: None,
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn in_any_group(&self, allowed: &[String]) -> bool {
        self.groups.iter().any(|g| allowed.contains(g))
    }
}

/// Free-form problem tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.value.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}:{}", self.key, self.value)
        }
    }
}

/// Immutable snapshot of an upstream problem, as reported on one poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    /// Globally unique problem (event) identifier
    pub id: String,
    pub name: String,
    pub severity: Severity,
    #[serde(default)]
    pub hosts: Vec<Host>,
    pub created_at: DateTime<Utc>,
    /// Resolution marker, absent while the problem is active
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub description: String,
    /// Upstream object that raised the problem, used to fetch detail
    #[serde(default)]
    pub trigger_id: Option<String>,
}

impl Problem {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        severity: Severity,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            severity,
            hosts: Vec::new(),
            created_at,
            resolved_at: None,
            acknowledged: false,
            tags: Vec::new(),
            description: String::new(),
            trigger_id: None,
        }
    }

    pub fn with_host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push(Tag {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn resolved(mut self, at: DateTime<Utc>) -> Self {
        self.resolved_at = Some(at);
        self
    }

    pub fn acknowledged(mut self) -> Self {
        self.acknowledged = true;
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Technical name of the first affected host
    pub fn primary_host(&self) -> Option<&Host> {
        self.hosts.first()
    }
}

/// Trigger context attached to a problem
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub description: String,
    #[serde(default)]
    pub comments: Option<String>,
}

/// Full problem context used to render and re-render an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetail {
    pub problem: Problem,
    #[serde(default)]
    pub trigger: Trigger,
    /// Hosts with addresses resolved; falls back to the problem's hosts
    #[serde(default)]
    pub hosts: Vec<Host>,
}

impl ProblemDetail {
    /// Detail built only from the snapshot, without extra upstream context
    pub fn from_problem(problem: Problem) -> Self {
        let hosts = problem.hosts.clone();
        Self {
            trigger: Trigger {
                description: problem.description.clone(),
                comments: None,
            },
            problem,
            hosts,
        }
    }

    pub fn id(&self) -> &str {
        &self.problem.id
    }

    pub fn primary_host(&self) -> Option<&Host> {
        self.hosts.first().or_else(|| self.problem.primary_host())
    }

    /// Display name of the first host, or a placeholder
    pub fn hostname(&self) -> &str {
        self.primary_host()
            .map(|h| h.visible_name.as_str())
            .unwrap_or("Unknown host")
    }

    /// Replace the status-bearing fields with those of a fresher snapshot
    pub fn refresh_status(&mut self, latest: &Problem) {
        self.problem.resolved_at = latest.resolved_at;
        self.problem.acknowledged = latest.acknowledged;
    }
}
