//! Dependency edges between automations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::new_id;

/// A directed "depends-on" edge: `source` depends on `target`
///
/// Multiple edges between the same pair are allowed when their
/// `dependency_type` differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationDependency {
    pub dependency_id: String,
    pub source_automation_id: String,
    pub target_automation_id: String,
    pub connection_id: String,
    pub dependency_type: String,
    pub created_at: DateTime<Utc>,
}

impl AutomationDependency {
    pub fn new(
        source_automation_id: impl Into<String>,
        target_automation_id: impl Into<String>,
        connection_id: impl Into<String>,
        dependency_type: impl Into<String>,
    ) -> Self {
        Self {
            dependency_id: new_id(),
            source_automation_id: source_automation_id.into(),
            target_automation_id: target_automation_id.into(),
            connection_id: connection_id.into(),
            dependency_type: dependency_type.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_self_reference(&self) -> bool {
        self.source_automation_id == self.target_automation_id
    }
}

impl std::fmt::Display for AutomationDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.source_automation_id, self.target_automation_id, self.dependency_type
        )
    }
}
