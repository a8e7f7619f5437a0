//! Automation identity

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Generate a new lowercase ULID identifier
pub fn new_id() -> String {
    Ulid::new().to_string().to_lowercase()
}

/// Compound key of an automation
///
/// An automation belongs to exactly one connection (the tenant/home boundary).
/// Every lookup that crosses from one connection into another must behave as
/// if the automation did not exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AutomationIdentity {
    pub automation_id: String,
    pub connection_id: String,
}

impl AutomationIdentity {
    pub fn new(automation_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            automation_id: automation_id.into(),
            connection_id: connection_id.into(),
        }
    }

    /// Check whether a connection may see this automation
    pub fn belongs_to(&self, connection_id: &str) -> bool {
        self.connection_id == connection_id
    }
}

impl std::fmt::Display for AutomationIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.automation_id, self.connection_id)
    }
}
