//! Automation lifecycle coordination
//!
//! This crate ties the version ledger, backup vault and dependency graph
//! together into the user-facing operations:
//!
//! - modify and rollback, driven as [`ModificationSession`]s
//! - retirement, driven as [`RetirementRequest`]s that may block on dependents
//! - backup restore, history, diff and statistics
//!
//! [`AutomationLifecycle`] is the facade a transport layer talks to.

pub mod api;
mod modification;
mod retirement;
mod rollback;
mod service;
mod session;
mod state_machine;
pub mod validation;

pub use api::{
    DiffRequest, ErrorResponse, HistoryRequest, HistoryResponse, ModificationResult,
    ModifyRequest, RestoreRequest, RetireRequest, RetirementResult, RollbackRequest,
};
pub use modification::{ModificationCoordinator, SessionCleanup, DEFAULT_CHANGE_SUMMARY};
pub use retirement::{RetirementCoordinator, TOMBSTONE_SUMMARY};
pub use rollback::RollbackPlanner;
pub use service::{AutomationLifecycle, CleanupReport, LifecycleHealth};
pub use session::{ModificationSession, ModificationState, RetirementRequest, RetirementState};
pub use state_machine::InvalidTransition;

// Re-export the building blocks so callers need a single dependency
pub use ha_backups::{BackupVault, RestoreOutcome};
pub use ha_dependencies::{DependencyAnalysis, DependencyGraph, RetirementResolution};
pub use ha_versioning::{HistoryPage, VersionDiffResult, VersionStatistics, VersionStore};
