//! Contract of the automation-authoring service
//!
//! The authoring service owns the live configuration pushed to the runtime.
//! The lifecycle core only decides and records *that* a change happened; the
//! actual push goes through this trait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::{AutomationIdentity, Configuration, Context, LifecycleError};

/// Errors reported by the authoring service
#[derive(Debug, Clone, Error)]
pub enum AuthoringError {
    #[error("configuration rejected by runtime: {0}")]
    Rejected(String),

    #[error("authoring service unavailable: {0}")]
    Unavailable(String),
}

impl From<AuthoringError> for LifecycleError {
    fn from(err: AuthoringError) -> Self {
        LifecycleError::Authoring(err.to_string())
    }
}

/// The automation-authoring collaborator
#[async_trait]
pub trait AutomationAuthoring: Send + Sync {
    /// Push a configuration to the runtime as the automation's live config
    async fn push_configuration(
        &self,
        identity: &AutomationIdentity,
        configuration: &Configuration,
        context: &Context,
    ) -> Result<(), AuthoringError>;

    /// Remove the automation from the runtime
    async fn retire(
        &self,
        identity: &AutomationIdentity,
        context: &Context,
    ) -> Result<(), AuthoringError>;
}

/// Shared handle to the authoring collaborator
pub type SharedAuthoring = Arc<dyn AutomationAuthoring>;

/// Await an authoring call within a time budget
///
/// An overrun surfaces as [`LifecycleError::Timeout`] instead of hanging the
/// caller; the in-flight call is dropped.
pub async fn within_budget<T, F>(operation: &str, budget: Duration, call: F) -> Result<T, LifecycleError>
where
    F: Future<Output = Result<T, AuthoringError>>,
{
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result.map_err(LifecycleError::from),
        Err(_) => Err(LifecycleError::timeout(operation, budget.as_millis() as u64)),
    }
}

/// Authoring implementation that accepts everything
///
/// Used when the lifecycle core runs standalone, without a runtime attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuthoring;

#[async_trait]
impl AutomationAuthoring for NoopAuthoring {
    async fn push_configuration(
        &self,
        _identity: &AutomationIdentity,
        _configuration: &Configuration,
        _context: &Context,
    ) -> Result<(), AuthoringError> {
        Ok(())
    }

    async fn retire(
        &self,
        _identity: &AutomationIdentity,
        _context: &Context,
    ) -> Result<(), AuthoringError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_authoring_accepts_everything() {
        let authoring: SharedAuthoring = Arc::new(NoopAuthoring);
        let identity = AutomationIdentity::new("a1", "c1");
        let ctx = Context::for_user("alice", "c1");

        assert!(authoring
            .push_configuration(&identity, &json!({}), &ctx)
            .await
            .is_ok());
        assert!(authoring.retire(&identity, &ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_within_budget_times_out() {
        let result: Result<(), _> = within_budget("push_configuration", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), crate::ErrorKind::Timeout);

        let ok = within_budget("push_configuration", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[test]
    fn test_authoring_error_maps_to_internal_kind() {
        let err: LifecycleError = AuthoringError::Unavailable("timeout".into()).into();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
    }
}
