//! Immutable automation version snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{new_id, AutomationIdentity};
use crate::Configuration;

/// An immutable snapshot of an automation's configuration
///
/// Versions form an append-only ledger per automation. The sequence number
/// strictly increases per `automation_id`; a version is never mutated once it
/// has been appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationVersion {
    pub version_id: String,
    pub automation_id: String,
    pub connection_id: String,
    pub sequence_number: u64,
    pub configuration: Configuration,
    pub author_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub change_summary: String,
    #[serde(default)]
    pub parent_version_id: Option<String>,
    /// Terminal version written when the automation was retired
    #[serde(default)]
    pub tombstone: bool,
}

impl AutomationVersion {
    pub fn identity(&self) -> AutomationIdentity {
        AutomationIdentity::new(&self.automation_id, &self.connection_id)
    }
}

/// Builder for a version that has not been assigned a sequence number yet
///
/// The sequence number is decided at append time, inside the apply lock, so
/// the same `NewVersion` can be retried after a sequence conflict.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub identity: AutomationIdentity,
    pub configuration: Configuration,
    pub author_name: String,
    pub author_email: Option<String>,
    pub change_summary: String,
    pub parent_version_id: Option<String>,
    pub tombstone: bool,
}

impl NewVersion {
    pub fn new(
        identity: AutomationIdentity,
        configuration: Configuration,
        author_name: impl Into<String>,
        change_summary: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            configuration,
            author_name: author_name.into(),
            author_email: None,
            change_summary: change_summary.into(),
            parent_version_id: None,
            tombstone: false,
        }
    }

    pub fn with_author_email(mut self, email: Option<String>) -> Self {
        self.author_email = email;
        self
    }

    pub fn with_parent(mut self, parent_version_id: Option<String>) -> Self {
        self.parent_version_id = parent_version_id;
        self
    }

    pub fn as_tombstone(mut self) -> Self {
        self.tombstone = true;
        self
    }

    /// Materialize the version with a concrete sequence number
    pub fn build(&self, sequence_number: u64) -> AutomationVersion {
        AutomationVersion {
            version_id: new_id(),
            automation_id: self.identity.automation_id.clone(),
            connection_id: self.identity.connection_id.clone(),
            sequence_number,
            configuration: self.configuration.clone(),
            author_name: self.author_name.clone(),
            author_email: self.author_email.clone(),
            created_at: Utc::now(),
            change_summary: self.change_summary.clone(),
            parent_version_id: self.parent_version_id.clone(),
            tombstone: self.tombstone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_assigns_fresh_ids() {
        let draft = NewVersion::new(
            AutomationIdentity::new("a1", "c1"),
            json!({"triggers": []}),
            "alice",
            "initial",
        )
        .with_parent(Some("v0".into()));

        let first = draft.build(1);
        let retry = draft.build(2);

        assert_ne!(first.version_id, retry.version_id);
        assert_eq!(first.sequence_number, 1);
        assert_eq!(retry.sequence_number, 2);
        assert_eq!(retry.parent_version_id.as_deref(), Some("v0"));
        assert!(!retry.tombstone);
    }

    #[test]
    fn test_serde_defaults_for_optional_fields() {
        let raw = json!({
            "version_id": "v1",
            "automation_id": "a1",
            "connection_id": "c1",
            "sequence_number": 1,
            "configuration": {},
            "author_name": "bob",
            "created_at": "2026-01-01T00:00:00Z",
            "change_summary": "created"
        });
        let version: AutomationVersion = serde_json::from_value(raw).unwrap();
        assert_eq!(version.parent_version_id, None);
        assert_eq!(version.author_email, None);
        assert!(!version.tombstone);
    }
}
