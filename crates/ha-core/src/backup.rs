//! Backup snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::new_id;
use crate::Configuration;

/// A snapshot taken before a mutating step
///
/// Backups are independent of version numbering and may exist without a
/// corresponding version (e.g. a backup taken before a modification that
/// later failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationBackup {
    pub backup_id: String,
    pub automation_id: String,
    pub connection_id: String,
    pub snapshot_configuration: Configuration,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// Latest version at the time the snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version_id: Option<String>,
}

impl AutomationBackup {
    pub fn new(
        automation_id: impl Into<String>,
        connection_id: impl Into<String>,
        snapshot_configuration: Configuration,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            backup_id: new_id(),
            automation_id: automation_id.into(),
            connection_id: connection_id.into(),
            snapshot_configuration,
            reason: reason.into(),
            created_at: Utc::now(),
            source_version_id: None,
        }
    }

    pub fn with_source_version(mut self, version_id: Option<String>) -> Self {
        self.source_version_id = version_id;
        self
    }
}
