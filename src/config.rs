//! Process configuration read from environment variables
//!
//! Required:
//! - ZABBIX_URL: Zabbix frontend URL (http/https)
//! - ZABBIX_API_TOKEN, or ZABBIX_USERNAME and ZABBIX_PASSWORD
//! - TELEGRAM_BOT_TOKEN: Bot API token
//! - TELEGRAM_CHAT_ID: Target chat id
//!
//! Everything else has a default; see `RelayConfig::from_lookup`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;

use crate::api::ServerConfig;
use crate::delivery::RetryPolicy;
use crate::filter::{FilterConfig, QuietHours};
use crate::model::Severity;
use crate::monitor::{LedgerConfig, MonitorConfig};

/// Authentication against the Zabbix API
#[derive(Clone, PartialEq, Eq)]
pub enum ZabbixAuth {
    Token(String),
    Login { username: String, password: String },
}

impl std::fmt::Debug for ZabbixAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZabbixAuth::Token(_) => f.write_str("Token(***)"),
            ZabbixAuth::Login { username, .. } => write!(f, "Login({}, ***)", username),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZabbixConfig {
    pub url: String,
    pub auth: ZabbixAuth,
    pub ssl_verify: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
    pub parse_mode: String,
    pub api_url: String,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"***")
            .field("chat_id", &self.chat_id)
            .field("parse_mode", &self.parse_mode)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Complete relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub zabbix: ZabbixConfig,
    pub telegram: TelegramConfig,
    pub filter: FilterConfig,
    pub delivery: RetryPolicy,
    pub monitor: MonitorConfig,
    pub database_path: PathBuf,
    pub server: ServerConfig,
}

/// Configuration errors; fatal at startup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

/// Typed access to a string lookup
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| invalid(key, format!("'{}': {}", raw, e))),
            None => Ok(default),
        }
    }

    fn bool(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
            Some(v) => Err(invalid(key, format!("'{}' is not a boolean", v))),
        }
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        let items: Vec<String> = self
            .get(key)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        (!items.is_empty()).then_some(items)
    }

    fn severity(&self, key: &'static str, default: Severity) -> Result<Severity, ConfigError> {
        let value: u8 = self.parse(key, default.value())?;
        Severity::new(value).ok_or_else(|| invalid(key, format!("{} is outside 0-5", value)))
    }

    fn time(&self, key: &'static str, default: &str) -> Result<NaiveTime, ConfigError> {
        let raw = self.string(key, default);
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .map_err(|_| invalid(key, format!("'{}' is not HH:MM", raw)))
    }

    fn positive_secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let secs: u64 = self.parse(key, default)?;
        if secs == 0 {
            return Err(invalid(key, "must be greater than 0"));
        }
        Ok(Duration::from_secs(secs))
    }
}

fn validate_url(key: &'static str, url: &str) -> Result<(), ConfigError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| invalid(key, "must start with http:// or https://"))?;
    if rest.trim_matches('/').is_empty() {
        return Err(invalid(key, "missing host"));
    }
    Ok(())
}

impl RelayConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let url = vars.required("ZABBIX_URL")?;
        validate_url("ZABBIX_URL", &url)?;

        let auth = match (
            vars.get("ZABBIX_API_TOKEN"),
            vars.get("ZABBIX_USERNAME"),
            vars.get("ZABBIX_PASSWORD"),
        ) {
            (Some(token), _, _) => ZabbixAuth::Token(token),
            (None, Some(username), Some(password)) => ZabbixAuth::Login { username, password },
            _ => {
                return Err(invalid(
                    "ZABBIX_API_TOKEN",
                    "set ZABBIX_API_TOKEN or both ZABBIX_USERNAME and ZABBIX_PASSWORD",
                ))
            }
        };

        let zabbix = ZabbixConfig {
            url: url.trim_end_matches('/').to_string(),
            auth,
            ssl_verify: vars.bool("ZABBIX_SSL_VERIFY", true)?,
        };

        let telegram = TelegramConfig {
            bot_token: vars.required("TELEGRAM_BOT_TOKEN")?,
            chat_id: vars
                .get("TELEGRAM_CHAT_ID")
                .ok_or(ConfigError::Missing("TELEGRAM_CHAT_ID"))?
                .parse()
                .map_err(|_| invalid("TELEGRAM_CHAT_ID", "must be an integer"))?,
            parse_mode: vars.string("TELEGRAM_PARSE_MODE", "HTML"),
            api_url: vars.string("TELEGRAM_API_URL", "https://api.telegram.org"),
        };

        let quiet_hours = if vars.bool("QUIET_HOURS_ENABLED", false)? {
            Some(QuietHours {
                start: vars.time("QUIET_HOURS_START", "22:00")?,
                end: vars.time("QUIET_HOURS_END", "08:00")?,
                min_severity: vars.severity("QUIET_HOURS_MIN_SEVERITY", Severity::HIGH)?,
            })
        } else {
            None
        };

        let filter = FilterConfig {
            min_severity: vars.severity("MIN_SEVERITY", Severity::WARNING)?,
            host_groups: vars.list("HOST_GROUPS"),
            excluded_hosts: vars.list("EXCLUDED_HOSTS"),
            quiet_hours,
        };

        let request_timeout = vars.positive_secs("REQUEST_TIMEOUT", 30)?;

        let attempts: u32 = vars.parse("MAX_RETRIES", 3)?;
        if attempts == 0 {
            return Err(invalid("MAX_RETRIES", "must be at least 1"));
        }
        let delivery = RetryPolicy {
            attempts,
            base_delay: Duration::from_secs(vars.parse("RETRY_DELAY", 1)?),
            timeout: request_timeout,
        };

        let max_attempts: u32 = vars.parse("RETRY_MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            return Err(invalid("RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }

        let page_size: usize = vars.parse("PAGE_SIZE", 50)?;
        if page_size == 0 {
            return Err(invalid("PAGE_SIZE", "must be greater than 0"));
        }

        let retention_days: u64 = vars.parse("RETENTION_DAYS", 30)?;

        let monitor = MonitorConfig {
            poll_interval: vars.positive_secs("POLL_INTERVAL", 60)?,
            page_size,
            request_timeout,
            retention: Duration::from_secs(retention_days * 24 * 3600),
            ledger: LedgerConfig {
                max_retry_attempts: max_attempts,
                delete_resolved_after: Duration::from_secs(vars.parse("DELETE_RESOLVED_AFTER", 3600)?),
                mark_resolved: vars.bool("MARK_RESOLVED", true)?,
                source_url: Some(zabbix.url.clone()),
                ..LedgerConfig::default()
            },
        };

        let server = ServerConfig {
            host: vars.string("RELAY_HOST", "0.0.0.0"),
            port: vars.parse("RELAY_PORT", 8080)?,
        };

        Ok(Self {
            zabbix,
            telegram,
            filter,
            delivery,
            monitor,
            database_path: PathBuf::from(vars.string("DATABASE_PATH", "data/alerts.db")),
            server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("ZABBIX_URL", "https://zabbix.example.com/"),
            ("ZABBIX_API_TOKEN", "secret"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "-1001234"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<RelayConfig, ConfigError> {
        RelayConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = load(&base()).unwrap();

        assert_eq!(config.zabbix.url, "https://zabbix.example.com");
        assert_eq!(config.zabbix.auth, ZabbixAuth::Token("secret".to_string()));
        assert_eq!(config.telegram.chat_id, -1001234);
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(60));
        assert_eq!(config.filter.min_severity, Severity::WARNING);
        assert!(config.filter.quiet_hours.is_none());
        assert_eq!(config.delivery.attempts, 3);
        assert_eq!(config.monitor.ledger.max_retry_attempts, 5);
        assert_eq!(config.monitor.ledger.delete_resolved_after, Duration::from_secs(3600));
        assert!(config.monitor.ledger.mark_resolved);
        assert_eq!(config.monitor.retention, Duration::from_secs(30 * 86400));
        assert_eq!(config.database_path, PathBuf::from("data/alerts.db"));
    }

    #[test]
    fn test_missing_required() {
        let mut vars = base();
        vars.remove("TELEGRAM_BOT_TOKEN");
        assert_eq!(load(&vars).unwrap_err(), ConfigError::Missing("TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn test_login_auth() {
        let mut vars = base();
        vars.remove("ZABBIX_API_TOKEN");
        vars.insert("ZABBIX_USERNAME", "admin");
        vars.insert("ZABBIX_PASSWORD", "zabbix");
        let config = load(&vars).unwrap();
        assert!(matches!(config.zabbix.auth, ZabbixAuth::Login { .. }));

        vars.remove("ZABBIX_PASSWORD");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("ZABBIX_URL", "ftp://zabbix"),
            ("POLL_INTERVAL", "0"),
            ("POLL_INTERVAL", "soon"),
            ("MIN_SEVERITY", "6"),
            ("TELEGRAM_CHAT_ID", "me"),
            ("MARK_RESOLVED", "maybe"),
            ("MAX_RETRIES", "0"),
        ] {
            let mut vars = base();
            vars.insert(key, value);
            assert!(
                matches!(load(&vars), Err(ConfigError::Invalid { .. })),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_filters_and_quiet_hours() {
        let mut vars = base();
        vars.insert("HOST_GROUPS", "Linux servers, Databases,");
        vars.insert("EXCLUDED_HOSTS", "test01");
        vars.insert("QUIET_HOURS_ENABLED", "true");
        vars.insert("QUIET_HOURS_START", "23:30");
        vars.insert("QUIET_HOURS_MIN_SEVERITY", "5");
        let config = load(&vars).unwrap();

        assert_eq!(
            config.filter.host_groups,
            Some(vec!["Linux servers".to_string(), "Databases".to_string()])
        );
        assert_eq!(config.filter.excluded_hosts, Some(vec!["test01".to_string()]));

        let quiet = config.filter.quiet_hours.unwrap();
        assert_eq!(quiet.start, NaiveTime::from_hms_opt(23, 30, 0).unwrap());
        assert_eq!(quiet.end, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(quiet.min_severity, Severity::DISASTER);
    }

    #[test]
    fn test_bad_quiet_hours_time() {
        let mut vars = base();
        vars.insert("QUIET_HOURS_ENABLED", "true");
        vars.insert("QUIET_HOURS_END", "25:00");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_delete_resolved_zero_allowed() {
        let mut vars = base();
        vars.insert("DELETE_RESOLVED_AFTER", "0");
        vars.insert("MARK_RESOLVED", "false");
        let config = load(&vars).unwrap();
        assert_eq!(config.monitor.ledger.delete_resolved_after, Duration::ZERO);
        assert!(!config.monitor.ledger.mark_resolved);
    }
}
