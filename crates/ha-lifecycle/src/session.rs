//! Modification sessions and retirement requests
//!
//! Both are per-user-action records that move through a closed state
//! machine (see [`crate::state_machine`]) and end in a terminal state or
//! expire.

use chrono::{DateTime, Utc};
use ha_core::{new_id, AutomationIdentity, Configuration, ErrorKind};
use serde::{Deserialize, Serialize};

use crate::state_machine::InvalidTransition;

/// Modification session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModificationState {
    /// Created, nothing checked yet
    #[default]
    Pending,
    /// Schema and semantic checks running
    Validating,
    /// Waiting for or holding the apply lock
    Applying,
    /// New version recorded (terminal)
    Completed,
    /// Validation or apply failed (terminal)
    Failed,
    /// Cancelled by the user (terminal)
    Cancelled,
    /// Swept by cleanup before finishing (terminal)
    Expired,
}

impl ModificationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModificationState::Completed
                | ModificationState::Failed
                | ModificationState::Cancelled
                | ModificationState::Expired
        )
    }
}

impl std::fmt::Display for ModificationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModificationState::Pending => "pending",
            ModificationState::Validating => "validating",
            ModificationState::Applying => "applying",
            ModificationState::Completed => "completed",
            ModificationState::Failed => "failed",
            ModificationState::Cancelled => "cancelled",
            ModificationState::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// One modify or rollback attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationSession {
    pub session_id: String,
    pub automation_id: String,
    pub connection_id: String,
    pub user_id: String,
    pub state: ModificationState,
    /// Configuration to apply. For rollbacks it is filled in once the target
    /// has been resolved.
    pub requested_change: Configuration,
    pub change_summary: String,
    /// Set for rollbacks once the target is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_target_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_version_id: Option<String>,
    /// Pre-modification backup taken during the apply phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
    /// The user asked to cancel while a write was in flight
    #[serde(default)]
    pub cancel_requested: bool,
    /// Backup, push or append is running
    #[serde(default)]
    pub apply_in_flight: bool,
}

impl ModificationSession {
    pub fn new(
        identity: &AutomationIdentity,
        user_id: impl Into<String>,
        requested_change: Configuration,
        change_summary: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: new_id(),
            automation_id: identity.automation_id.clone(),
            connection_id: identity.connection_id.clone(),
            user_id: user_id.into(),
            state: ModificationState::Pending,
            requested_change,
            change_summary: change_summary.into(),
            rollback_target_version_id: None,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            updated_at: now,
            result_version_id: None,
            backup_id: None,
            failure_reason: None,
            failure_kind: None,
            cancel_requested: false,
            apply_in_flight: false,
        }
    }

    pub fn identity(&self) -> AutomationIdentity {
        AutomationIdentity::new(&self.automation_id, &self.connection_id)
    }

    /// Move to `to`, rejecting illegal transitions
    pub fn transition(
        &mut self,
        to: ModificationState,
    ) -> Result<(), InvalidTransition<ModificationState>> {
        self.state = self.state.try_transition(to)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && now > self.expires_at
    }
}

/// Retirement request state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetirementState {
    /// Created, dependencies not yet resolved
    #[default]
    Initiated,
    /// Dependents exist and the request was not forced
    Blocked,
    /// Backup, runtime retire and tombstone append running
    Resolving,
    /// Tombstone recorded (terminal, irreversible)
    Retired,
    /// Cancelled, superseded or failed to apply (terminal)
    Cancelled,
}

impl RetirementState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetirementState::Retired | RetirementState::Cancelled)
    }

    /// The request may still be cancelled or superseded
    pub fn is_open(&self) -> bool {
        matches!(self, RetirementState::Initiated | RetirementState::Blocked)
    }
}

impl std::fmt::Display for RetirementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetirementState::Initiated => "initiated",
            RetirementState::Blocked => "blocked",
            RetirementState::Resolving => "resolving",
            RetirementState::Retired => "retired",
            RetirementState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A request to retire an automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetirementRequest {
    pub retirement_id: String,
    pub automation_id: String,
    pub connection_id: String,
    pub user_id: String,
    pub force_retirement: bool,
    pub state: RetirementState,
    #[serde(default)]
    pub blocking_dependency_ids: Vec<String>,
    #[serde(default)]
    pub blocking_automation_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone_version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<ErrorKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetirementRequest {
    pub fn new(identity: &AutomationIdentity, user_id: impl Into<String>, force: bool) -> Self {
        let now = Utc::now();
        Self {
            retirement_id: new_id(),
            automation_id: identity.automation_id.clone(),
            connection_id: identity.connection_id.clone(),
            user_id: user_id.into(),
            force_retirement: force,
            state: RetirementState::Initiated,
            blocking_dependency_ids: Vec::new(),
            blocking_automation_ids: Vec::new(),
            backup_id: None,
            tombstone_version_id: None,
            failure_reason: None,
            failure_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identity(&self) -> AutomationIdentity {
        AutomationIdentity::new(&self.automation_id, &self.connection_id)
    }

    pub fn transition(
        &mut self,
        to: RetirementState,
    ) -> Result<(), InvalidTransition<RetirementState>> {
        self.state = self.state.try_transition(to)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_defaults() {
        let identity = AutomationIdentity::new("a1", "home-1");
        let session = ModificationSession::new(
            &identity,
            "alice",
            json!({"alias": "x"}),
            "rename",
            chrono::Duration::seconds(900),
        );

        assert_eq!(session.state, ModificationState::Pending);
        assert_eq!(session.identity(), identity);
        assert_eq!(session.expires_at - session.created_at, chrono::Duration::seconds(900));
        assert!(!session.is_expired_at(session.created_at));
        assert!(session.is_expired_at(session.expires_at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_unbounded_ttl_never_expires() {
        let identity = AutomationIdentity::new("a1", "home-1");
        let session = ModificationSession::new(
            &identity,
            "alice",
            json!({}),
            "x",
            chrono::Duration::max_value(),
        );
        assert_eq!(session.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!session.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_session_transition_rejects_leaving_terminal() {
        let identity = AutomationIdentity::new("a1", "home-1");
        let mut session = ModificationSession::new(
            &identity,
            "alice",
            json!({}),
            "x",
            chrono::Duration::seconds(1),
        );
        session.transition(ModificationState::Cancelled).unwrap();

        let err = session.transition(ModificationState::Validating).unwrap_err();
        assert_eq!(err.from, ModificationState::Cancelled);
        assert_eq!(session.state, ModificationState::Cancelled);
        assert!(!session.is_expired_at(Utc::now() + chrono::Duration::days(1)));
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_value(ModificationState::Applying).unwrap(),
            json!("applying")
        );
        assert_eq!(
            serde_json::to_value(RetirementState::Blocked).unwrap(),
            json!("blocked")
        );
        assert_eq!(RetirementState::Retired.to_string(), "retired");
    }

    #[test]
    fn test_retirement_request_open_states() {
        assert!(RetirementState::Initiated.is_open());
        assert!(RetirementState::Blocked.is_open());
        assert!(!RetirementState::Resolving.is_open());
        assert!(!RetirementState::Retired.is_open());
        assert!(RetirementState::Cancelled.is_terminal());
    }
}
