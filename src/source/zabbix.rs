//! Zabbix JSON-RPC source adapter

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::{ProblemSource, SourceError};
use crate::config::{ZabbixAuth, ZabbixConfig};
use crate::model::{Host, Problem, ProblemDetail, Severity, Tag, Trigger};

/// Client for the Zabbix JSON-RPC API
pub struct ZabbixSource {
    client: reqwest::Client,
    api_url: String,
    auth: ZabbixAuth,
    /// Session token obtained by `user.login`, or the static API token
    token: RwLock<Option<String>>,
    request_id: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct RawProblem {
    eventid: String,
    #[serde(default)]
    objectid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    clock: String,
    #[serde(default)]
    r_eventid: String,
    #[serde(default)]
    r_clock: String,
    #[serde(default)]
    acknowledged: String,
    #[serde(default)]
    tags: Vec<RawTag>,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    tag: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RawTrigger {
    triggerid: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    comments: String,
    #[serde(default)]
    hosts: Vec<RawHostRef>,
}

#[derive(Debug, Deserialize)]
struct RawHostRef {
    hostid: String,
}

#[derive(Debug, Deserialize)]
struct RawHost {
    hostid: String,
    host: String,
    #[serde(default)]
    name: String,
    #[serde(default, alias = "hostgroups")]
    groups: Vec<RawGroup>,
    #[serde(default)]
    interfaces: Vec<RawInterface>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawInterface {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    dns: String,
}

#[derive(Debug, Deserialize)]
struct RawRecovery {
    eventid: String,
    clock: String,
}

fn parse_clock(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .filter(|secs| *secs > 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

impl From<RawHost> for Host {
    fn from(raw: RawHost) -> Self {
        let address = raw
            .interfaces
            .iter()
            .map(|i| if i.ip.is_empty() { i.dns.as_str() } else { i.ip.as_str() })
            .find(|a| !a.is_empty())
            .map(str::to_string);

        Host {
            id: raw.hostid,
            visible_name: if raw.name.is_empty() {
                raw.host.clone()
            } else {
                raw.name
            },
            name: raw.host,
            groups: raw.groups.into_iter().map(|g| g.name).collect(),
            address,
        }
    }
}

/// Convert a batch of events, skipping any that fail validation so one bad
/// entry cannot block the rest
fn convert_batch(raw: Vec<RawProblem>, recoveries: &HashMap<String, DateTime<Utc>>) -> Vec<Problem> {
    let mut problems = Vec::with_capacity(raw.len());
    for item in raw {
        let recovered_at = recoveries.get(&item.r_eventid).copied();
        match item.into_problem(recovered_at) {
            Ok(problem) => problems.push(problem),
            Err(e) => tracing::warn!(error = %e, "Skipping malformed event"),
        }
    }
    problems
}

impl RawProblem {
    /// Convert into a typed snapshot; `recovered_at` supplies the recovery
    /// clock when the payload itself does not carry one
    fn into_problem(self, recovered_at: Option<DateTime<Utc>>) -> Result<Problem, SourceError> {
        let severity = self
            .severity
            .parse::<u8>()
            .ok()
            .and_then(Severity::new)
            .ok_or_else(|| {
                SourceError::Malformed(format!(
                    "event {} has invalid severity '{}'",
                    self.eventid, self.severity
                ))
            })?;

        let created_at = parse_clock(&self.clock).ok_or_else(|| {
            SourceError::Malformed(format!("event {} has invalid clock '{}'", self.eventid, self.clock))
        })?;

        let resolved = !self.r_eventid.is_empty() && self.r_eventid != "0";
        let resolved_at = resolved.then(|| {
            parse_clock(&self.r_clock)
                .or(recovered_at)
                .unwrap_or_else(Utc::now)
        });

        Ok(Problem {
            id: self.eventid,
            name: self.name,
            severity,
            hosts: Vec::new(),
            created_at,
            resolved_at,
            acknowledged: self.acknowledged == "1",
            tags: self
                .tags
                .into_iter()
                .map(|t| Tag {
                    key: t.tag,
                    value: t.value,
                })
                .collect(),
            description: String::new(),
            trigger_id: (!self.objectid.is_empty()).then_some(self.objectid),
        })
    }
}

impl ZabbixSource {
    pub fn new(config: &ZabbixConfig, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!config.ssl_verify)
            .build()?;

        let token = match &config.auth {
            ZabbixAuth::Token(token) => Some(token.clone()),
            ZabbixAuth::Login { .. } => None,
        };

        Ok(Self {
            client,
            api_url: format!("{}/api_jsonrpc.php", config.url.trim_end_matches('/')),
            auth: config.auth.clone(),
            token: RwLock::new(token),
            request_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
        authenticated: bool,
    ) -> Result<T, SourceError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        });

        let mut request = self.client.post(&self.api_url).json(&body);
        if authenticated {
            let token = self.token.read().clone();
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
        }

        let response: RpcResponse<T> = request.send().await?.error_for_status()?.json().await?;

        if let Some(error) = response.error {
            return Err(SourceError::Api {
                code: error.code,
                message: format!("{} {}", error.message, error.data).trim().to_string(),
            });
        }

        response
            .result
            .ok_or_else(|| SourceError::Malformed(format!("{} returned no result", method)))
    }

    /// Authenticated request, logging in first when using credentials
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SourceError> {
        let needs_login = self.token.read().is_none();
        if needs_login {
            self.login().await?;
        }
        self.request(method, params, true).await
    }

    async fn login(&self) -> Result<(), SourceError> {
        let ZabbixAuth::Login { username, password } = &self.auth else {
            return Ok(());
        };

        let token: String = self
            .request(
                "user.login",
                json!({ "username": username, "password": password }),
                false,
            )
            .await
            .map_err(|e| SourceError::Auth(e.to_string()))?;

        *self.token.write() = Some(token);
        tracing::info!("Authenticated to Zabbix");
        Ok(())
    }

    async fn triggers(&self, trigger_ids: &[String]) -> Result<Vec<RawTrigger>, SourceError> {
        if trigger_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.call(
            "trigger.get",
            json!({
                "output": ["triggerid", "description", "comments"],
                "triggerids": trigger_ids,
                "selectHosts": ["hostid"],
                "expandDescription": true,
                "expandComment": true,
            }),
        )
        .await
    }

    async fn hosts(&self, host_ids: &[String]) -> Result<Vec<Host>, SourceError> {
        if host_ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<RawHost> = self
            .call(
                "host.get",
                json!({
                    "output": ["hostid", "host", "name"],
                    "hostids": host_ids,
                    "selectHostGroups": ["name"],
                    "selectInterfaces": ["ip", "dns"],
                }),
            )
            .await?;
        Ok(raw.into_iter().map(Host::from).collect())
    }

    /// Attach trigger descriptions and hosts to freshly parsed problems
    async fn enrich(&self, problems: &mut [Problem]) -> Result<(), SourceError> {
        let mut trigger_ids: Vec<String> = problems.iter().filter_map(|p| p.trigger_id.clone()).collect();
        trigger_ids.sort();
        trigger_ids.dedup();

        let triggers = self.triggers(&trigger_ids).await?;

        let mut host_ids: Vec<String> = triggers
            .iter()
            .flat_map(|t| t.hosts.iter().map(|h| h.hostid.clone()))
            .collect();
        host_ids.sort();
        host_ids.dedup();

        let hosts: HashMap<String, Host> = self
            .hosts(&host_ids)
            .await?
            .into_iter()
            .map(|h| (h.id.clone(), h))
            .collect();

        let by_trigger: HashMap<&str, &RawTrigger> =
            triggers.iter().map(|t| (t.triggerid.as_str(), t)).collect();

        for problem in problems.iter_mut() {
            let Some(trigger) = problem.trigger_id.as_deref().and_then(|id| by_trigger.get(id)) else {
                continue;
            };
            problem.description = trigger.description.clone();
            problem.hosts = trigger
                .hosts
                .iter()
                .filter_map(|h| hosts.get(&h.hostid).cloned())
                .collect();
        }
        Ok(())
    }
}

#[async_trait]
impl ProblemSource for ZabbixSource {
    fn name(&self) -> &'static str {
        "zabbix"
    }

    async fn fetch_problems(&self, limit: usize) -> Result<Vec<Problem>, SourceError> {
        let raw: Vec<RawProblem> = self
            .call(
                "problem.get",
                json!({
                    "output": "extend",
                    "selectTags": "extend",
                    "recent": true,
                    "sortfield": ["eventid"],
                    "sortorder": "DESC",
                    "limit": limit,
                }),
            )
            .await?;

        let mut problems = convert_batch(raw, &HashMap::new());
        self.enrich(&mut problems).await?;
        Ok(problems)
    }

    async fn fetch_problem_detail(&self, problem: &Problem) -> Result<ProblemDetail, SourceError> {
        let trigger_ids: Vec<String> = problem.trigger_id.iter().cloned().collect();
        let triggers = self.triggers(&trigger_ids).await?;
        let Some(trigger) = triggers.into_iter().next() else {
            return Ok(ProblemDetail::from_problem(problem.clone()));
        };

        let hosts = if problem.hosts.is_empty() {
            let ids: Vec<String> = trigger.hosts.iter().map(|h| h.hostid.clone()).collect();
            self.hosts(&ids).await?
        } else {
            problem.hosts.clone()
        };

        Ok(ProblemDetail {
            problem: problem.clone(),
            trigger: Trigger {
                description: trigger.description,
                comments: (!trigger.comments.is_empty()).then_some(trigger.comments),
            },
            hosts,
        })
    }

    async fn fetch_events(&self, ids: &[String]) -> Result<Vec<Problem>, SourceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<RawProblem> = self
            .call(
                "event.get",
                json!({
                    "output": "extend",
                    "eventids": ids,
                    "selectTags": "extend",
                }),
            )
            .await?;

        // event.get does not report the recovery clock; look it up separately
        let recovery_ids: Vec<&str> = raw
            .iter()
            .map(|r| r.r_eventid.as_str())
            .filter(|id| !id.is_empty() && *id != "0")
            .collect();

        let recoveries: HashMap<String, DateTime<Utc>> = if recovery_ids.is_empty() {
            HashMap::new()
        } else {
            let raw: Vec<RawRecovery> = self
                .call(
                    "event.get",
                    json!({ "output": ["eventid", "clock"], "eventids": recovery_ids }),
                )
                .await?;
            raw.into_iter()
                .filter_map(|r| parse_clock(&r.clock).map(|at| (r.eventid, at)))
                .collect()
        };

        Ok(convert_batch(raw, &recoveries))
    }

    async fn check_connection(&self) -> bool {
        if let Err(e) = self
            .request::<String>("apiinfo.version", json!([]), false)
            .await
        {
            tracing::warn!(error = %e, "Zabbix is unreachable");
            return false;
        }

        if matches!(self.auth, ZabbixAuth::Login { .. }) {
            // Sessions expire; always re-login on an explicit check.
            *self.token.write() = None;
            if let Err(e) = self.login().await {
                tracing::error!(error = %e, "Zabbix re-authentication failed");
                return false;
            }
        }
        true
    }
}
