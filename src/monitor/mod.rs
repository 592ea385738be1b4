//! Alert lifecycle engine: ledger, polling scheduler and status views

pub mod ledger;
pub mod scheduler;
pub mod status;

pub use ledger::{Admission, Ledger, LedgerConfig, LedgerStats, RetryReport};
pub use scheduler::{Monitor, MonitorConfig, MonitorError, Phase, TickReport};
pub use status::{MonitorHandle, MonitorStatus, StatusSnapshot};
