//! Automation Version Ledger
//!
//! Every change to an automation's configuration is recorded as an immutable
//! [`AutomationVersion`](ha_core::AutomationVersion) in an append-only,
//! per-automation ledger. The "current configuration" is never stored as a
//! mutable pointer; it is always the answer to [`VersionStore::latest`].
//!
//! # Key Types
//!
//! - [`VersionStore`] - the ledger: append, history, latest, diff, statistics,
//!   retention
//! - [`VersionDiffResult`] - structural comparison of two versions
//! - [`VersionStatistics`] - per-automation counters for dashboards
//! - [`ApplyLocks`] - per-automation mutual exclusion for the apply phase

pub mod diff;
pub mod locks;
pub mod statistics;
pub mod store;

pub use diff::{
    diff_configurations, ConfigurationDiff, FieldChange, FieldValue, VersionDiffResult,
    SET_LIKE_FIELDS,
};
pub use locks::{ApplyGuard, ApplyLocks};
pub use statistics::VersionStatistics;
pub use store::{HistoryPage, VersionLedgerSnapshot, VersionStore};
