//! Rendering of alerts into chat markup (HTML parse mode)

use chrono::{DateTime, Utc};

use super::Controls;
use crate::model::{AlertState, ProblemDetail};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Escape text for HTML parse mode
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format(TIME_FORMAT).to_string()
}

/// Link to the problem in the source's web UI
pub fn problem_url(source_url: &str, problem_id: &str) -> String {
    format!(
        "{}/zabbix.php?action=problem.view&filter_eventids[]={}",
        source_url.trim_end_matches('/'),
        problem_id
    )
}

/// Render an alert message and its controls.
///
/// The status header follows the problem snapshot carried by `detail`, so
/// re-rendering a refreshed detail yields the edited message.
pub fn render_alert(detail: &ProblemDetail, source_url: Option<&str>) -> (String, Option<Controls>) {
    let problem = &detail.problem;
    let state = AlertState::of(problem);

    let (header, status) = match state {
        AlertState::Resolved => ("✅ <b>Problem resolved</b>", "✅ RESOLVED"),
        AlertState::Acknowledged => ("🔕 <b>Problem acknowledged</b>", "🔕 ACKNOWLEDGED"),
        AlertState::Active => ("🚨 <b>Problem active</b>", "🔴 PROBLEM"),
    };

    let host = detail.primary_host();
    let host_name = host
        .map(|h| escape_html(&h.visible_name))
        .unwrap_or_else(|| "Unknown host".to_string());
    let address = host
        .and_then(|h| h.address.as_deref())
        .map(|a| format!(" ({})", escape_html(a)))
        .unwrap_or_default();

    let description = if detail.trigger.description.is_empty() {
        "No description".to_string()
    } else {
        escape_html(&detail.trigger.description)
    };

    let mut lines = vec![
        header.to_string(),
        String::new(),
        format!("{} {}", problem.severity.icon(), problem.severity.label()),
        format!("<b>Host:</b> {}{}", host_name, address),
        format!("<b>Problem:</b> {}", escape_html(&problem.name)),
        format!("<b>Description:</b> {}", description),
        format!("<b>Time:</b> {}", format_time(problem.created_at)),
        format!("<b>Event ID:</b> {}", escape_html(&problem.id)),
        String::new(),
        format!("<b>Status:</b> {}", status),
    ];

    if let Some(resolved_at) = problem.resolved_at {
        lines.push(format!("<b>Resolved at:</b> {}", format_time(resolved_at)));
    }

    if !problem.tags.is_empty() {
        let tags: Vec<String> = problem
            .tags
            .iter()
            .filter(|t| !t.key.is_empty())
            .map(|t| escape_html(&t.to_string()))
            .collect();
        if !tags.is_empty() {
            lines.push(format!("<b>Tags:</b> {}", tags.join(", ")));
        }
    }

    if let Some(comments) = detail.trigger.comments.as_deref().filter(|c| !c.is_empty()) {
        lines.push(format!("<b>Comments:</b> {}", escape_html(comments)));
    }

    let controls = source_url
        .filter(|url| !url.is_empty())
        .map(|url| Controls::link("🔗 Open in Zabbix", problem_url(url, &problem.id)));

    (lines.join("\n"), controls)
}
