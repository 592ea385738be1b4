//! Upstream problem source
//!
//! The relay only consumes this seam; [`ZabbixSource`] is the production
//! implementation.

pub mod zabbix;

pub use zabbix::ZabbixSource;

use async_trait::async_trait;

use crate::model::{Problem, ProblemDetail};

/// Adapter over the monitoring system that reports problems
#[async_trait]
pub trait ProblemSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Most recent problems, newest first, at most `limit`
    async fn fetch_problems(&self, limit: usize) -> Result<Vec<Problem>, SourceError>;

    /// Full context (trigger, host addresses) for one problem
    async fn fetch_problem_detail(&self, problem: &Problem) -> Result<ProblemDetail, SourceError>;

    /// Current snapshots of the given problem ids; unknown ids are omitted
    async fn fetch_events(&self, ids: &[String]) -> Result<Vec<Problem>, SourceError>;

    /// Probe the source, re-authenticating when needed
    async fn check_connection(&self) -> bool;
}

/// Failures talking to the source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Source API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Malformed source data: {0}")]
    Malformed(String),

    #[error("Source request timed out")]
    Timeout,
}
