//! Core types for automation lifecycle management
//!
//! This crate provides the identity model and value objects shared by every
//! lifecycle component: automation identities, immutable version snapshots,
//! backups, dependency edges, the error taxonomy, and the contract of the
//! external automation-authoring service.

mod authoring;
mod backup;
mod context;
mod dependency;
mod error;
mod event;
mod identity;
mod version;

pub use authoring::{
    within_budget, AuthoringError, AutomationAuthoring, NoopAuthoring, SharedAuthoring,
};
pub use backup::AutomationBackup;
pub use context::Context;
pub use dependency::AutomationDependency;
pub use error::{ErrorKind, LifecycleError, LifecycleResult, RuleViolation};
pub use event::{Event, EventData, MATCH_ALL};
pub use identity::{new_id, AutomationIdentity};
pub use version::{AutomationVersion, NewVersion};

/// Opaque structured automation configuration document
pub type Configuration = serde_json::Value;

/// Standard lifecycle event types published on the event bus
pub mod events {
    use super::*;
    use chrono::{DateTime, Utc};

    /// Fired after a version is appended to the ledger
    pub const VERSION_CREATED: &str = "automation_version_created";

    /// Fired after an automation is retired
    pub const AUTOMATION_RETIRED: &str = "automation_retired";

    /// Fired after a backup has been restored as a new version
    pub const BACKUP_RESTORED: &str = "automation_backup_restored";

    /// Data for VERSION_CREATED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct VersionCreatedData {
        pub automation_id: String,
        pub connection_id: String,
        pub version_id: String,
        pub sequence_number: u64,
        pub change_summary: String,
        pub tombstone: bool,
        pub created_at: DateTime<Utc>,
    }

    impl EventData for VersionCreatedData {
        fn event_type() -> &'static str {
            VERSION_CREATED
        }
    }

    impl From<&AutomationVersion> for VersionCreatedData {
        fn from(version: &AutomationVersion) -> Self {
            Self {
                automation_id: version.automation_id.clone(),
                connection_id: version.connection_id.clone(),
                version_id: version.version_id.clone(),
                sequence_number: version.sequence_number,
                change_summary: version.change_summary.clone(),
                tombstone: version.tombstone,
                created_at: version.created_at,
            }
        }
    }

    /// Data for AUTOMATION_RETIRED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct AutomationRetiredData {
        pub automation_id: String,
        pub connection_id: String,
        pub retirement_id: String,
        pub tombstone_version_id: String,
        pub forced: bool,
        /// Dependency edges that were still present when retirement was forced
        pub blocking_dependency_ids: Vec<String>,
    }

    impl EventData for AutomationRetiredData {
        fn event_type() -> &'static str {
            AUTOMATION_RETIRED
        }
    }

    /// Data for BACKUP_RESTORED events
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct BackupRestoredData {
        pub automation_id: String,
        pub connection_id: String,
        pub backup_id: String,
        pub version_id: String,
    }

    impl EventData for BackupRestoredData {
        fn event_type() -> &'static str {
            BACKUP_RESTORED
        }
    }
}
