//! Alert Relay: monitoring problems delivered to a chat channel
//!
//! Polls a monitoring source for problems, filters them, and relays each one
//! to a chat channel exactly once per lifecycle. The original message is
//! edited in place as the problem is acknowledged or resolved, and removed
//! after a grace period when configured.
//!
//! # Features
//!
//! - **Filter Engine**: severity threshold, quiet hours, host-group allow-list, host deny-list
//! - **Delivery Channel**: bounded retries with exponential backoff, message chunking, idempotent edit/delete
//! - **Alert Ledger**: single-writer lifecycle state with a bounded retry queue
//! - **Persistence**: SQLite alert history, audit log and daily counters
//! - **Status API**: read-only HTTP view of the running monitor
//!
//! # Example
//!
//! ```no_run
//! use alert_relay::filter::{should_send, FilterConfig};
//! use alert_relay::model::{Problem, Severity};
//! use chrono::{NaiveTime, Utc};
//!
//! let config = FilterConfig::default().with_min_severity(Severity::AVERAGE);
//! let problem = Problem::new("42", "Disk full", Severity::HIGH, Utc::now());
//!
//! let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
//! assert!(should_send(&problem, &config, noon));
//! ```

pub mod api;
pub mod config;
pub mod delivery;
pub mod filter;
pub mod model;
pub mod monitor;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use config::{ConfigError, RelayConfig};
pub use delivery::{DeliveryChannel, DeliveryError};
pub use model::{AlertRecord, AlertState, Problem, Severity};
pub use monitor::{Monitor, MonitorHandle};
pub use store::{AlertStore, StoreError};
