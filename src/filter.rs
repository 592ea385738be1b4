//! Filter engine deciding whether a problem is eligible for first delivery
//!
//! Pure functions only. Rules are evaluated in a fixed order and the first
//! rejection wins:
//!
//! 1. resolved problems are never delivered
//! 2. severity threshold (raised during quiet hours)
//! 3. host-group allow-list
//! 4. host deny-list

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::model::{Problem, Severity};

/// Time-of-day window with an elevated severity threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub min_severity: Severity,
}

impl QuietHours {
    /// Whether `now` falls inside the window; `start > end` wraps midnight
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start > self.end {
            now >= self.start || now <= self.end
        } else {
            self.start <= now && now <= self.end
        }
    }
}

/// Filter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub min_severity: Severity,
    /// Only hosts in at least one of these groups pass, when set
    pub host_groups: Option<Vec<String>>,
    /// Hosts never alerted on, by technical name
    pub excluded_hosts: Option<Vec<String>>,
    pub quiet_hours: Option<QuietHours>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_severity: Severity::WARNING,
            host_groups: None,
            excluded_hosts: None,
            quiet_hours: None,
        }
    }
}

impl FilterConfig {
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    pub fn with_host_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.host_groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_excluded_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_hosts = Some(hosts.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours) -> Self {
        self.quiet_hours = Some(quiet_hours);
        self
    }

    /// Severity a problem needs at time `now`
    pub fn required_severity(&self, now: NaiveTime) -> Severity {
        match &self.quiet_hours {
            Some(q) if q.contains(now) => q.min_severity.max(self.min_severity),
            _ => self.min_severity,
        }
    }

    /// One-line-per-rule description of the active filters
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Minimum severity: {}", self.min_severity)];

        if let Some(groups) = self.host_groups.as_ref().filter(|g| !g.is_empty()) {
            lines.push(format!("Host groups: {}", groups.join(", ")));
        }
        if let Some(hosts) = self.excluded_hosts.as_ref().filter(|h| !h.is_empty()) {
            lines.push(format!("Excluded hosts: {}", hosts.join(", ")));
        }
        if let Some(q) = &self.quiet_hours {
            lines.push(format!(
                "Quiet hours: {} - {} (min severity {})",
                q.start.format("%H:%M"),
                q.end.format("%H:%M"),
                q.min_severity
            ));
        }

        lines.join("\n")
    }
}

/// Outcome of evaluating a problem against the filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Send,
    AlreadyResolved,
    BelowSeverity {
        severity: Severity,
        required: Severity,
        quiet_hours: bool,
    },
    GroupNotAllowed,
    HostExcluded(String),
}

impl FilterDecision {
    pub fn passes(&self) -> bool {
        matches!(self, FilterDecision::Send)
    }
}

/// Evaluate all rules in order, returning the first rejection
pub fn evaluate(problem: &Problem, config: &FilterConfig, now: NaiveTime) -> FilterDecision {
    if problem.is_resolved() {
        return FilterDecision::AlreadyResolved;
    }

    let required = config.required_severity(now);
    if problem.severity < required {
        return FilterDecision::BelowSeverity {
            severity: problem.severity,
            required,
            quiet_hours: required != config.min_severity,
        };
    }

    if let Some(groups) = config.host_groups.as_ref().filter(|g| !g.is_empty()) {
        if !problem.hosts.iter().any(|h| h.in_any_group(groups)) {
            return FilterDecision::GroupNotAllowed;
        }
    }

    if let Some(excluded) = config.excluded_hosts.as_ref().filter(|h| !h.is_empty()) {
        if let Some(host) = problem.hosts.iter().find(|h| excluded.contains(&h.name)) {
            return FilterDecision::HostExcluded(host.name.clone());
        }
    }

    FilterDecision::Send
}

/// Whether a problem should be delivered at time-of-day `now`
pub fn should_send(problem: &Problem, config: &FilterConfig, now: NaiveTime) -> bool {
    let decision = evaluate(problem, config, now);
    if !decision.passes() {
        tracing::debug!(problem_id = %problem.id, ?decision, "Problem filtered out");
    }
    decision.passes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Host;
    use chrono::Utc;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn problem(severity: u8) -> Problem {
        Problem::new("1", "Load high", Severity::new(severity).unwrap(), Utc::now())
            .with_host(Host::new("10", "web01").with_groups(["Linux servers"]))
    }

    fn quiet() -> QuietHours {
        QuietHours {
            start: time(22, 0),
            end: time(8, 0),
            min_severity: Severity::HIGH,
        }
    }

    #[test]
    fn test_severity_threshold() {
        let config = FilterConfig::default().with_min_severity(Severity::WARNING);
        assert!(should_send(&problem(4), &config, time(12, 0)));
        assert!(should_send(&problem(2), &config, time(12, 0)));
        assert!(!should_send(&problem(1), &config, time(12, 0)));
    }

    #[test]
    fn test_resolved_rejected_first() {
        let config = FilterConfig::default().with_excluded_hosts(["web01"]);
        let resolved = problem(5).resolved(Utc::now());
        assert_eq!(
            evaluate(&resolved, &config, time(12, 0)),
            FilterDecision::AlreadyResolved
        );
    }

    #[test]
    fn test_quiet_hours_overnight_window() {
        let q = quiet();
        assert!(q.contains(time(23, 0)));
        assert!(q.contains(time(3, 30)));
        assert!(q.contains(time(8, 0)));
        assert!(!q.contains(time(12, 0)));
        assert!(!q.contains(time(21, 59)));
    }

    #[test]
    fn test_quiet_hours_same_day_window() {
        let q = QuietHours {
            start: time(12, 0),
            end: time(14, 0),
            min_severity: Severity::HIGH,
        };
        assert!(q.contains(time(13, 0)));
        assert!(!q.contains(time(23, 0)));
    }

    #[test]
    fn test_quiet_hours_scenario() {
        let config = FilterConfig::default()
            .with_min_severity(Severity::WARNING)
            .with_quiet_hours(quiet());

        assert!(!should_send(&problem(3), &config, time(23, 0)));
        assert!(should_send(&problem(5), &config, time(23, 0)));
        assert!(should_send(&problem(3), &config, time(12, 0)));
    }

    #[test]
    fn test_quiet_hours_only_tighten() {
        // A quiet-hours minimum below the normal one must not loosen the filter.
        let config = FilterConfig::default()
            .with_min_severity(Severity::HIGH)
            .with_quiet_hours(QuietHours {
                min_severity: Severity::INFORMATION,
                ..quiet()
            });

        for severity in 0..=5u8 {
            let p = problem(severity);
            let quiet_pass = should_send(&p, &config, time(23, 0));
            let normal_pass = should_send(&p, &config, time(12, 0));
            assert!(!quiet_pass || normal_pass, "severity {} loosened", severity);
        }
    }

    #[test]
    fn test_host_group_allow_list() {
        let allowed = FilterConfig::default().with_host_groups(["Linux servers", "Databases"]);
        assert!(should_send(&problem(3), &allowed, time(12, 0)));

        let other = FilterConfig::default().with_host_groups(["Windows servers"]);
        assert_eq!(
            evaluate(&problem(3), &other, time(12, 0)),
            FilterDecision::GroupNotAllowed
        );
    }

    #[test]
    fn test_host_deny_list() {
        let config = FilterConfig::default().with_excluded_hosts(["web01"]);
        assert_eq!(
            evaluate(&problem(3), &config, time(12, 0)),
            FilterDecision::HostExcluded("web01".to_string())
        );

        let config = FilterConfig::default().with_excluded_hosts(["db01"]);
        assert!(should_send(&problem(3), &config, time(12, 0)));
    }

    #[test]
    fn test_empty_lists_are_unset() {
        let config = FilterConfig {
            host_groups: Some(vec![]),
            excluded_hosts: Some(vec![]),
            ..FilterConfig::default()
        };
        assert!(should_send(&problem(3), &config, time(12, 0)));
    }

    #[test]
    fn test_summary_lists_rules() {
        let config = FilterConfig::default()
            .with_host_groups(["Databases"])
            .with_quiet_hours(quiet());
        let summary = config.summary();
        assert!(summary.contains("Host groups: Databases"));
        assert!(summary.contains("Quiet hours: 22:00 - 08:00"));
    }
}
