//! Typed data model shared by the relay components
//!
//! `Problem`/`ProblemDetail` are immutable snapshots produced by the source
//! adapter. `AlertRecord` and `RetryItem` are owned by the ledger.

pub mod alert;
pub mod problem;

pub use alert::{AlertRecord, AlertState, MessageId, RetryItem, TransitionError};
pub use problem::{Host, Problem, ProblemDetail, Severity, Tag, Trigger};
