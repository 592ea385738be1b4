use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{AlertRecord, AlertState};
use crate::monitor::{MonitorHandle, MonitorStatus};
use crate::store::{metrics, AlertStore, AuditEvent, StoreError, StoreSummary};

/// Application state shared across handlers
pub struct AppState {
    pub monitor: MonitorHandle,
    pub store: AlertStore,
}

const DEFAULT_PROBLEM_LIMIT: usize = 10;
const MAX_PROBLEM_LIMIT: usize = 50;
const DEFAULT_ALERT_LIMIT: usize = 50;
const MAX_ALERT_LIMIT: usize = 200;
const DEFAULT_EVENT_LIMIT: usize = 20;
const MAX_EVENT_LIMIT: usize = 200;
const STATS_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

impl LimitParams {
    fn bounded(&self, default: usize, max: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, max)
    }
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub monitor_running: bool,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        monitor_running: state.monitor.is_running(),
    })
}

// ============================================================================
// Monitor
// ============================================================================

pub async fn status(State(state): State<Arc<AppState>>) -> Json<MonitorStatus> {
    Json(state.monitor.status().await)
}

#[derive(Serialize)]
pub struct ProblemsResponse {
    pub count: usize,
    pub problems: Vec<AlertRecord>,
}

pub async fn active_problems(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Json<ProblemsResponse> {
    let limit = params.bounded(DEFAULT_PROBLEM_LIMIT, MAX_PROBLEM_LIMIT);
    let problems = state.monitor.active_problems(limit);

    Json(ProblemsResponse {
        count: problems.len(),
        problems,
    })
}

// ============================================================================
// Alert History
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AlertsParams {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct AlertsResponse {
    pub state: AlertState,
    pub count: usize,
    pub alerts: Vec<AlertRecord>,
}

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertsParams>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let alert_state = match params.state.as_deref() {
        Some(raw) => raw.parse::<AlertState>().map_err(ApiError::BadRequest)?,
        None => AlertState::Active,
    };
    let limit = LimitParams { limit: params.limit }.bounded(DEFAULT_ALERT_LIMIT, MAX_ALERT_LIMIT);

    let alerts = state
        .store
        .call(move |s| s.list_by_state(alert_state, limit))
        .await?;

    Ok(Json(AlertsResponse {
        state: alert_state,
        count: alerts.len(),
        alerts,
    }))
}

pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AlertRecord>, ApiError> {
    let lookup = id.clone();
    state
        .store
        .call(move |s| s.get_alert(&lookup))
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Alert '{}' not found", id)))
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub count: usize,
    pub events: Vec<AuditEvent>,
}

pub async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Result<Json<EventsResponse>, ApiError> {
    let limit = params.bounded(DEFAULT_EVENT_LIMIT, MAX_EVENT_LIMIT);
    let events = state.store.call(move |s| s.recent_events(limit)).await?;

    Ok(Json(EventsResponse {
        count: events.len(),
        events,
    }))
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Serialize)]
pub struct StatsSummaryResponse {
    #[serde(flatten)]
    pub summary: StoreSummary,
    pub window_days: i64,
    /// Daily counters summed over the window
    pub totals: BTreeMap<&'static str, i64>,
}

pub async fn stats_summary(State(state): State<Arc<AppState>>) -> Result<Json<StatsSummaryResponse>, ApiError> {
    let to = Utc::now().date_naive();
    let from = to - Duration::days(STATS_WINDOW_DAYS - 1);

    let (summary, totals) = state
        .store
        .call(move |s| {
            let summary = s.summary()?;
            let mut totals = BTreeMap::new();
            for metric in [
                metrics::ALERTS_SENT,
                metrics::ALERTS_FAILED,
                metrics::ALERTS_RESOLVED,
                metrics::PROBLEMS_FOUND,
                metrics::CHECKS,
            ] {
                totals.insert(metric, s.sum_stat(metric, from, to)?);
            }
            Ok((summary, totals))
        })
        .await?;

    Ok(Json(StatsSummaryResponse {
        summary,
        window_days: STATS_WINDOW_DAYS,
        totals,
    }))
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "Store query failed");
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
