//! Request and response shapes for the transport layer
//!
//! Every response carries `success` and, on failure, a human-readable
//! `error_message` plus a machine-readable `error_kind`. Internal faults are
//! redacted before they reach these types.

use ha_core::{AutomationVersion, Configuration, ErrorKind, LifecycleError, RuleViolation};
use ha_versioning::HistoryPage;
use serde::{Deserialize, Serialize};

use crate::session::{ModificationSession, ModificationState, RetirementRequest, RetirementState};

fn default_page_number() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

/// Change an automation's configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub automation_id: String,
    pub connection_id: String,
    pub user_id: String,
    pub requested_change: Configuration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
}

impl ModifyRequest {
    pub fn new(
        automation_id: impl Into<String>,
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        requested_change: Configuration,
    ) -> Self {
        Self {
            automation_id: automation_id.into(),
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            requested_change,
            change_summary: None,
            author_email: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.change_summary = Some(summary.into());
        self
    }
}

/// Roll an automation back to an earlier version
///
/// Without a target the version immediately preceding the current one is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub automation_id: String,
    pub connection_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version_id: Option<String>,
}

/// Outcome of a modify, rollback or cancel call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ModificationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<RuleViolation>,
}

impl ModificationResult {
    /// Describe a session; success means it completed
    pub fn from_session(session: &ModificationSession) -> Self {
        let success = matches!(session.state, ModificationState::Completed);
        Self {
            success,
            session_id: Some(session.session_id.clone()),
            state: Some(session.state),
            result_version_id: session.result_version_id.clone(),
            backup_id: session.backup_id.clone(),
            error_message: session.failure_reason.clone(),
            error_kind: session.failure_kind,
            violations: Vec::new(),
        }
    }

    /// A failure that happened before or without a session
    pub fn from_error(err: &LifecycleError) -> Self {
        Self {
            success: false,
            session_id: None,
            state: None,
            result_version_id: None,
            backup_id: None,
            error_message: Some(err.public_message()),
            error_kind: Some(err.kind()),
            violations: err.violations().to_vec(),
        }
    }

    pub fn with_violations(mut self, violations: Vec<RuleViolation>) -> Self {
        self.violations = violations;
        self
    }

    pub fn succeeded(mut self) -> Self {
        self.success = true;
        self
    }
}

/// Retire an automation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetireRequest {
    pub automation_id: String,
    pub connection_id: String,
    pub user_id: String,
    #[serde(default)]
    pub force_retirement: bool,
}

impl RetireRequest {
    pub fn new(
        automation_id: impl Into<String>,
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        force_retirement: bool,
    ) -> Self {
        Self {
            automation_id: automation_id.into(),
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            force_retirement,
        }
    }
}

/// Outcome of a retirement call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetirementResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retirement_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<RetirementState>,
    /// Reported whenever dependents exist, including forced retirements
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking_dependency_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tombstone_version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl RetirementResult {
    pub fn from_request(request: &RetirementRequest) -> Self {
        let blocked = request.state == RetirementState::Blocked;
        Self {
            success: request.state == RetirementState::Retired,
            retirement_id: Some(request.retirement_id.clone()),
            state: Some(request.state),
            blocking_dependency_ids: request.blocking_dependency_ids.clone(),
            tombstone_version_id: request.tombstone_version_id.clone(),
            backup_id: request.backup_id.clone(),
            error_message: if blocked {
                Some(format!(
                    "blocked by {} dependency edge(s)",
                    request.blocking_dependency_ids.len()
                ))
            } else {
                request.failure_reason.clone()
            },
            error_kind: if blocked {
                Some(ErrorKind::DependencyBlocked)
            } else {
                request.failure_kind
            },
        }
    }

    pub fn from_error(err: &LifecycleError) -> Self {
        Self {
            success: false,
            retirement_id: None,
            state: None,
            blocking_dependency_ids: Vec::new(),
            tombstone_version_id: None,
            backup_id: None,
            error_message: Some(err.public_message()),
            error_kind: Some(err.kind()),
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.success = true;
        self
    }
}

/// One page of an automation's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub automation_id: String,
    pub connection_id: String,
    /// 1-based
    #[serde(default = "default_page_number")]
    pub page_number: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub entries: Vec<AutomationVersion>,
    pub total_entries: usize,
    pub page_number: usize,
    pub page_size: usize,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl From<HistoryPage> for HistoryResponse {
    fn from(page: HistoryPage) -> Self {
        Self {
            success: true,
            entries: page.entries,
            total_entries: page.total_entries,
            page_number: page.page_number,
            page_size: page.page_size,
            is_complete: page.is_complete,
            error_message: None,
            error_kind: None,
        }
    }
}

impl HistoryResponse {
    pub fn from_error(request: &HistoryRequest, err: &LifecycleError) -> Self {
        Self {
            success: false,
            entries: Vec::new(),
            total_entries: 0,
            page_number: request.page_number,
            page_size: request.page_size,
            is_complete: true,
            error_message: Some(err.public_message()),
            error_kind: Some(err.kind()),
        }
    }
}

/// Compare two versions of the same connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRequest {
    pub version_id_1: String,
    pub version_id_2: String,
    pub connection_id: String,
}

/// Restore a backup as a new version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub backup_id: String,
    pub user_id: String,
    pub connection_id: String,
}

/// Failure body for operations without a dedicated result shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error_message: String,
    pub error_kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<RuleViolation>,
}

impl From<&LifecycleError> for ErrorResponse {
    fn from(err: &LifecycleError) -> Self {
        Self {
            success: false,
            error_message: err.public_message(),
            error_kind: err.kind(),
            violations: err.violations().to_vec(),
        }
    }
}
