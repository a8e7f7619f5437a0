//! Error taxonomy shared by all lifecycle components

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Machine-readable error kind reported to the external interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    SequenceConflict,
    ValidationFailure,
    DependencyBlocked,
    Timeout,
    InvalidState,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::SequenceConflict => "sequence_conflict",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::DependencyBlocked => "dependency_blocked",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A single violated validation rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    /// Stable rule code, e.g. `trigger_required`
    pub rule: String,
    /// Human-readable explanation
    pub message: String,
    /// Location in the configuration document, if applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl RuleViolation {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
            path: None,
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Lifecycle errors
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Access across a connection boundary. Displays exactly like `NotFound`
    /// so existence is never leaked to the other tenant.
    #[error("{entity} not found: {id}")]
    CrossTenant {
        entity: &'static str,
        id: String,
        connection_id: String,
    },

    #[error("sequence conflict for automation {automation_id}: expected {expected}, got {attempted}")]
    SequenceConflict {
        automation_id: String,
        expected: u64,
        attempted: u64,
    },

    #[error("validation failed: {}", summarize(.0))]
    ValidationFailed(Vec<RuleViolation>),

    #[error("blocked by {} dependency edge(s)", .blocking_dependency_ids.len())]
    DependencyBlocked { blocking_dependency_ids: Vec<String> },

    #[error("{operation} exceeded its budget of {budget_ms}ms")]
    Timeout { operation: String, budget_ms: u64 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("authoring service error: {0}")]
    Authoring(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn summarize(violations: &[RuleViolation]) -> String {
    violations
        .iter()
        .map(|v| v.rule.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl LifecycleError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LifecycleError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn cross_tenant(
        entity: &'static str,
        id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        LifecycleError::CrossTenant {
            entity,
            id: id.into(),
            connection_id: connection_id.into(),
        }
    }

    /// Shorthand for a single-rule validation failure
    pub fn violation(rule: impl Into<String>, message: impl Into<String>) -> Self {
        LifecycleError::ValidationFailed(vec![RuleViolation::new(rule, message)])
    }

    pub fn timeout(operation: impl Into<String>, budget_ms: u64) -> Self {
        LifecycleError::Timeout {
            operation: operation.into(),
            budget_ms,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::NotFound { .. } | LifecycleError::CrossTenant { .. } => {
                ErrorKind::NotFound
            }
            LifecycleError::SequenceConflict { .. } => ErrorKind::SequenceConflict,
            LifecycleError::ValidationFailed(_) => ErrorKind::ValidationFailure,
            LifecycleError::DependencyBlocked { .. } => ErrorKind::DependencyBlocked,
            LifecycleError::Timeout { .. } => ErrorKind::Timeout,
            LifecycleError::InvalidState(_) => ErrorKind::InvalidState,
            LifecycleError::Authoring(_)
            | LifecycleError::Storage(_)
            | LifecycleError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_sequence_conflict(&self) -> bool {
        matches!(self, LifecycleError::SequenceConflict { .. })
    }

    /// Violated rules, empty for non-validation errors
    pub fn violations(&self) -> &[RuleViolation] {
        match self {
            LifecycleError::ValidationFailed(v) => v,
            _ => &[],
        }
    }

    /// Message safe to hand back across the external interface
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}
