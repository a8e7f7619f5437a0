//! Modification Coordinator
//!
//! Drives modify and rollback sessions through
//! `Pending → Validating → Applying → Completed`:
//!
//! 1. validation runs without any lock
//! 2. the apply phase holds the automation's apply lock while it takes a
//!    pre-modification backup, pushes the configuration to the authoring
//!    service and appends the new version
//!
//! A failure anywhere leaves the version ledger untouched; a backup taken
//! before the failure is kept.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ha_backups::BackupVault;
use ha_config::{ApplyConfig, LifecycleConfig, SessionConfig};
use ha_core::{
    within_budget, AutomationIdentity, AutomationVersion, Context, LifecycleError,
    LifecycleResult, NewVersion, SharedAuthoring,
};
use ha_dependencies::DependencyGraph;
use ha_versioning::VersionStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::api::{ModificationResult, ModifyRequest, RollbackRequest};
use crate::rollback::RollbackPlanner;
use crate::session::{ModificationSession, ModificationState};
use crate::validation;

/// Summary used when a modify request does not carry one
pub const DEFAULT_CHANGE_SUMMARY: &str = "configuration updated";

enum Plan {
    Modify,
    Rollback { target_version_id: Option<String> },
}

enum CancelOutcome {
    AlreadyTerminal,
    Deferred,
    Cancelled,
}

/// Sessions touched by one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCleanup {
    pub expired: Vec<String>,
    pub purged: Vec<String>,
}

/// Coordinates configuration changes and rollbacks
pub struct ModificationCoordinator {
    versions: Arc<VersionStore>,
    backups: Arc<BackupVault>,
    graph: Arc<DependencyGraph>,
    planner: RollbackPlanner,
    authoring: SharedAuthoring,

    /// Primary index: session_id -> session
    sessions: DashMap<String, ModificationSession>,
    /// Index: (automation_id, user_id) -> most recent session_id
    by_user: DashMap<(String, String), String>,
    /// Index: automation_id -> most recent session_id
    by_automation: DashMap<String, String>,

    session_config: SessionConfig,
    apply_config: ApplyConfig,
}

impl ModificationCoordinator {
    pub fn new(
        versions: Arc<VersionStore>,
        backups: Arc<BackupVault>,
        graph: Arc<DependencyGraph>,
        authoring: SharedAuthoring,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            planner: RollbackPlanner::new(versions.clone()),
            versions,
            backups,
            graph,
            authoring,
            sessions: DashMap::new(),
            by_user: DashMap::new(),
            by_automation: DashMap::new(),
            session_config: config.sessions.clone(),
            apply_config: config.apply.clone(),
        }
    }

    pub fn planner(&self) -> &RollbackPlanner {
        &self.planner
    }

    /// Apply a configuration change
    #[instrument(skip(self, request), fields(
        automation_id = %request.automation_id,
        connection_id = %request.connection_id,
        user_id = %request.user_id,
    ))]
    pub async fn modify(&self, request: ModifyRequest) -> ModificationResult {
        let identity = AutomationIdentity::new(&request.automation_id, &request.connection_id);
        let summary = request
            .change_summary
            .unwrap_or_else(|| DEFAULT_CHANGE_SUMMARY.to_string());
        let session_id = self.open(
            &identity,
            &request.user_id,
            request.requested_change,
            summary,
        );
        self.drive(&session_id, Plan::Modify, request.author_email)
            .await
    }

    /// Roll back to `target_version_id`, or to the previous version when `None`
    #[instrument(skip(self, request), fields(
        automation_id = %request.automation_id,
        connection_id = %request.connection_id,
        user_id = %request.user_id,
    ))]
    pub async fn rollback_to(&self, request: RollbackRequest) -> ModificationResult {
        let identity = AutomationIdentity::new(&request.automation_id, &request.connection_id);
        let session_id = self.open(
            &identity,
            &request.user_id,
            serde_json::Value::Null,
            "rollback".to_string(),
        );
        let plan = Plan::Rollback {
            target_version_id: request.target_version_id,
        };
        self.drive(&session_id, plan, None).await
    }

    fn open(
        &self,
        identity: &AutomationIdentity,
        user_id: &str,
        requested_change: serde_json::Value,
        change_summary: String,
    ) -> String {
        let session = ModificationSession::new(
            identity,
            user_id,
            requested_change,
            change_summary,
            self.session_config.ttl(),
        );
        let session_id = session.session_id.clone();
        self.sessions.insert(session_id.clone(), session);
        self.by_user.insert(
            (identity.automation_id.clone(), user_id.to_string()),
            session_id.clone(),
        );
        self.by_automation
            .insert(identity.automation_id.clone(), session_id.clone());
        debug!(session_id = %session_id, "Opened modification session");
        session_id
    }

    async fn drive(
        &self,
        session_id: &str,
        plan: Plan,
        author_email: Option<String>,
    ) -> ModificationResult {
        let mut violations = Vec::new();
        let mut guard = FailOnDrop {
            coordinator: self,
            session_id,
            armed: true,
        };
        let outcome = self.run(session_id, plan, author_email).await;
        guard.armed = false;
        if let Err(err) = outcome {
            match err.kind() {
                ha_core::ErrorKind::Internal => {
                    error!(session_id, error = %err, "Modification failed")
                }
                _ => info!(session_id, error = %err, "Modification rejected"),
            }
            violations = err.violations().to_vec();
            self.fail(session_id, &err);
        }

        match self.session(session_id) {
            Ok(session) => ModificationResult::from_session(&session).with_violations(violations),
            Err(err) => ModificationResult::from_error(&err),
        }
    }

    async fn run(
        &self,
        session_id: &str,
        plan: Plan,
        author_email: Option<String>,
    ) -> LifecycleResult<()> {
        let session = self.session(session_id)?;
        let identity = session.identity();
        let automation_id = identity.automation_id.as_str();
        let connection_id = identity.connection_id.as_str();

        self.advance(session_id, ModificationState::Validating)?;

        if let Some(owner) = self.versions.connection_of(automation_id) {
            if owner != connection_id {
                return Err(LifecycleError::cross_tenant(
                    "automation",
                    automation_id,
                    connection_id,
                ));
            }
        }
        let current = self.versions.latest(automation_id, connection_id).ok();

        let is_rollback = matches!(plan, Plan::Rollback { .. });
        let (configuration, summary) = match plan {
            Plan::Modify => (session.requested_change, session.change_summary),
            Plan::Rollback { target_version_id } => {
                let target = match target_version_id {
                    Some(id) => self.planner.validate(automation_id, &id, connection_id)?,
                    None => self.planner.previous_target(automation_id, connection_id)?,
                };
                let summary = format!("rollback to {}", target.version_id);
                self.update(session_id, |s| {
                    s.requested_change = target.configuration.clone();
                    s.change_summary = summary.clone();
                    s.rollback_target_version_id = Some(target.version_id.clone());
                })?;
                (target.configuration, summary)
            }
        };

        let mut violations = validation::check_document(automation_id, &configuration);
        violations.extend(validation::check_change(
            automation_id,
            connection_id,
            &configuration,
            current.as_ref(),
            &self.graph,
            is_rollback,
        )?);
        if !violations.is_empty() {
            return Err(LifecycleError::ValidationFailed(violations));
        }

        self.advance(session_id, ModificationState::Applying)?;
        let _guard = self.versions.apply_lock(&identity).await;

        // Cancel or cleanup may have won while we waited for the lock
        let state = self.update(session_id, |s| {
            if s.state == ModificationState::Applying {
                s.apply_in_flight = true;
            }
            s.state
        })?;
        if state != ModificationState::Applying {
            return Err(LifecycleError::InvalidState(format!(
                "session {} was {} before the apply started",
                session_id, state
            )));
        }

        // Another apply may have landed while we waited
        let current = self.versions.latest(automation_id, connection_id).ok();
        if current.as_ref().is_some_and(|v| v.tombstone) {
            return Err(LifecycleError::violation(
                "automation_retired",
                format!("automation {} was retired", automation_id),
            ));
        }

        if let Some(current) = &current {
            let backup = self.backups.create(
                automation_id,
                connection_id,
                current.configuration.clone(),
                "pre-modification",
            )?;
            self.update(session_id, |s| s.backup_id = Some(backup.backup_id))?;
        }

        let context = Context::for_user(&session.user_id, connection_id);
        within_budget(
            "push_configuration",
            self.apply_config.authoring_timeout(),
            self.authoring
                .push_configuration(&identity, &configuration, &context),
        )
        .await?;

        let draft = NewVersion::new(identity.clone(), configuration, &session.user_id, summary)
            .with_author_email(author_email)
            .with_parent(current.map(|v| v.version_id));
        let version = self.append(session_id, &draft)?;

        self.update(session_id, |s| {
            s.result_version_id = Some(version.version_id.clone());
            s.apply_in_flight = false;
            s.transition(ModificationState::Completed)
        })?
        .map_err(|e| LifecycleError::InvalidState(e.to_string()))?;

        info!(
            session_id,
            version_id = %version.version_id,
            sequence = version.sequence_number,
            "Modification applied"
        );
        Ok(())
    }

    /// Append at the next sequence number, retrying sequence conflicts
    ///
    /// No retry is started once the user asked to cancel.
    fn append(&self, session_id: &str, draft: &NewVersion) -> LifecycleResult<AutomationVersion> {
        let mut attempt = 0;
        loop {
            let sequence = self
                .versions
                .next_sequence_number(&draft.identity.automation_id);
            match self.versions.append(draft.build(sequence)) {
                Err(err)
                    if err.is_sequence_conflict()
                        && attempt < self.apply_config.sequence_conflict_retries =>
                {
                    let cancel_requested = self
                        .session(session_id)
                        .map(|s| s.cancel_requested)
                        .unwrap_or(true);
                    if cancel_requested {
                        info!(session_id, "Cancel requested, not retrying append");
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(session_id, attempt, "Sequence conflict on append, retrying");
                }
                result => return result,
            }
        }
    }

    fn update<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut ModificationSession) -> R,
    ) -> LifecycleResult<R> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| LifecycleError::not_found("modification session", session_id))?;
        Ok(f(&mut session))
    }

    fn advance(&self, session_id: &str, to: ModificationState) -> LifecycleResult<()> {
        self.update(session_id, |s| s.transition(to))?
            .map_err(|e| LifecycleError::InvalidState(e.to_string()))
    }

    fn fail(&self, session_id: &str, err: &LifecycleError) {
        let _ = self.update(session_id, |s| {
            s.apply_in_flight = false;
            if s.state.is_terminal() {
                return;
            }
            s.failure_reason = Some(err.public_message());
            s.failure_kind = Some(err.kind());
            if let Err(invalid) = s.transition(ModificationState::Failed) {
                warn!(session_id = %s.session_id, error = %invalid, "Could not mark session failed");
            }
        });
    }

    /// Cancel the user's most recent session for an automation
    ///
    /// Cancelling a terminal session is a no-op success. While a write is in
    /// flight the request is recorded and the write is allowed to finish;
    /// the result then reports `success = false` with the session still
    /// applying. A session on another connection reads as not found.
    #[instrument(skip(self))]
    pub fn cancel(
        &self,
        automation_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> ModificationResult {
        let key = (automation_id.to_string(), user_id.to_string());
        let session_id = match self.by_user.get(&key).map(|r| r.value().clone()) {
            Some(session_id) => session_id,
            None => {
                return ModificationResult::from_error(&LifecycleError::not_found(
                    "modification session",
                    automation_id,
                ))
            }
        };

        let outcome = self.update(&session_id, |s| {
            if s.connection_id != connection_id {
                return Err(LifecycleError::cross_tenant(
                    "modification session",
                    automation_id,
                    connection_id,
                ));
            }
            if s.state.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal);
            }
            s.cancel_requested = true;
            // A flag without a held lock means the write was abandoned
            if s.apply_in_flight && self.versions.is_applying(&s.identity()) {
                return Ok(CancelOutcome::Deferred);
            }
            s.apply_in_flight = false;
            Ok(match s.transition(ModificationState::Cancelled) {
                Ok(()) => CancelOutcome::Cancelled,
                Err(_) => CancelOutcome::AlreadyTerminal,
            })
        });

        let outcome = match outcome.and_then(|inner| inner) {
            Ok(outcome) => outcome,
            Err(err) => return ModificationResult::from_error(&err),
        };
        let session = match self.session(&session_id) {
            Ok(session) => session,
            Err(err) => return ModificationResult::from_error(&err),
        };

        match outcome {
            CancelOutcome::Cancelled => {
                info!(session_id = %session_id, "Cancelled session");
                ModificationResult::from_session(&session).succeeded()
            }
            CancelOutcome::AlreadyTerminal => {
                debug!(session_id = %session_id, "Session already terminal");
                ModificationResult::from_session(&session).succeeded()
            }
            CancelOutcome::Deferred => {
                info!(session_id = %session_id, "Write in flight, cancel recorded");
                let err = LifecycleError::InvalidState(format!(
                    "session {} is writing, cancel recorded",
                    session_id
                ));
                ModificationResult {
                    error_message: Some(err.public_message()),
                    error_kind: Some(err.kind()),
                    ..ModificationResult::from_session(&session)
                }
            }
        }
    }

    /// Expire past-due sessions and purge old terminal ones
    ///
    /// Sessions whose write still holds the apply lock are left alone.
    /// Versions and backups are never touched.
    pub fn cleanup_expired(&self) -> SessionCleanup {
        let now = Utc::now();
        let mut cleanup = SessionCleanup::default();

        for mut entry in self.sessions.iter_mut() {
            if !entry.is_expired_at(now) {
                continue;
            }
            // A flag without a held lock means the write was abandoned
            if entry.apply_in_flight && self.versions.is_applying(&entry.identity()) {
                continue;
            }
            if entry.transition(ModificationState::Expired).is_ok() {
                entry.apply_in_flight = false;
                cleanup.expired.push(entry.key().clone());
            }
        }

        let retention = self.session_config.terminal_retention();
        cleanup.purged = self
            .sessions
            .iter()
            .filter(|s| {
                s.state.is_terminal()
                    && s.updated_at
                        .checked_add_signed(retention)
                        .is_some_and(|until| until < now)
            })
            .map(|s| s.key().clone())
            .collect();
        for session_id in &cleanup.purged {
            self.sessions.remove(session_id);
        }
        if !cleanup.purged.is_empty() {
            self.by_user.retain(|_, id| self.sessions.contains_key(id));
            self.by_automation
                .retain(|_, id| self.sessions.contains_key(id));
        }

        if !cleanup.expired.is_empty() || !cleanup.purged.is_empty() {
            info!(
                expired = cleanup.expired.len(),
                purged = cleanup.purged.len(),
                "Cleaned up modification sessions"
            );
        }
        cleanup
    }

    pub fn session(&self, session_id: &str) -> LifecycleResult<ModificationSession> {
        self.sessions
            .get(session_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| LifecycleError::not_found("modification session", session_id))
    }

    /// Most recent session for an automation
    pub fn status(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<ModificationSession> {
        let session_id = self
            .by_automation
            .get(automation_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| LifecycleError::not_found("modification session", automation_id))?;
        let session = self.session(&session_id)?;
        if session.connection_id != connection_id {
            return Err(LifecycleError::cross_tenant(
                "modification session",
                automation_id,
                connection_id,
            ));
        }
        Ok(session)
    }

    /// Sessions that have not reached a terminal state
    pub fn active_sessions(&self) -> Vec<ModificationSession> {
        self.sessions
            .iter()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Fails the session if the pipeline unwinds or is dropped mid-flight
struct FailOnDrop<'a> {
    coordinator: &'a ModificationCoordinator,
    session_id: &'a str,
    armed: bool,
}

impl Drop for FailOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            error!(session_id = self.session_id, "Modification pipeline aborted");
            self.coordinator.fail(
                self.session_id,
                &LifecycleError::Internal("modification pipeline aborted".into()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::{ErrorKind, NoopAuthoring};
    use serde_json::json;

    struct Fixture {
        versions: Arc<VersionStore>,
        backups: Arc<BackupVault>,
        graph: Arc<DependencyGraph>,
        coordinator: ModificationCoordinator,
    }

    fn fixture() -> Fixture {
        let versions = Arc::new(VersionStore::new());
        let authoring: SharedAuthoring = Arc::new(NoopAuthoring);
        let backups = Arc::new(BackupVault::new(versions.clone(), authoring.clone()));
        let graph = Arc::new(DependencyGraph::new());
        let coordinator = ModificationCoordinator::new(
            versions.clone(),
            backups.clone(),
            graph.clone(),
            authoring,
            &LifecycleConfig::default(),
        );
        Fixture {
            versions,
            backups,
            graph,
            coordinator,
        }
    }

    fn config(alias: &str) -> serde_json::Value {
        json!({
            "alias": alias,
            "triggers": [{"trigger": "state", "entity_id": "binary_sensor.door"}],
            "actions": [{"action": "light.turn_on"}]
        })
    }

    fn modify(alias: &str) -> ModifyRequest {
        ModifyRequest::new("porch", "home-1", "alice", config(alias))
    }

    #[tokio::test]
    async fn test_first_modify_creates_version_without_backup() {
        let f = fixture();

        let result = f.coordinator.modify(modify("one")).await;

        assert!(result.success, "{result:?}");
        assert_eq!(result.state, Some(ModificationState::Completed));
        assert!(result.backup_id.is_none());
        let latest = f.versions.latest("porch", "home-1").unwrap();
        assert_eq!(Some(latest.version_id.clone()), result.result_version_id);
        assert_eq!(latest.sequence_number, 1);
        assert_eq!(latest.change_summary, DEFAULT_CHANGE_SUMMARY);
        assert!(latest.parent_version_id.is_none());
    }

    #[tokio::test]
    async fn test_modify_backs_up_current_and_links_parent() {
        let f = fixture();
        let first = f.coordinator.modify(modify("one")).await;

        let second = f
            .coordinator
            .modify(modify("two").with_summary("rename"))
            .await;

        assert!(second.success);
        let latest = f.versions.latest("porch", "home-1").unwrap();
        assert_eq!(latest.sequence_number, 2);
        assert_eq!(latest.parent_version_id, first.result_version_id);
        assert_eq!(latest.change_summary, "rename");

        let backup = f.backups.get(second.backup_id.as_deref().unwrap()).unwrap();
        assert_eq!(backup.reason, "pre-modification");
        assert_eq!(backup.snapshot_configuration, config("one"));
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_store_untouched() {
        let f = fixture();
        f.coordinator.modify(modify("one")).await;

        let request = ModifyRequest::new("porch", "home-1", "alice", json!({"alias": "broken"}));
        let result = f.coordinator.modify(request).await;

        assert!(!result.success);
        assert_eq!(result.state, Some(ModificationState::Failed));
        assert_eq!(result.error_kind, Some(ErrorKind::ValidationFailure));
        let rules: Vec<&str> = result.violations.iter().map(|v| v.rule.as_str()).collect();
        assert_eq!(rules, vec!["trigger_required", "action_required"]);
        assert_eq!(f.versions.version_count(), 1);
        assert!(f.backups.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_configuration_rejected() {
        let f = fixture();
        f.coordinator.modify(modify("one")).await;

        let result = f.coordinator.modify(modify("one")).await;

        assert_eq!(result.violations[0].rule, "configuration_unchanged");
    }

    #[tokio::test]
    async fn test_cross_connection_modify_is_not_found() {
        let f = fixture();
        f.coordinator.modify(modify("one")).await;

        let request = ModifyRequest::new("porch", "home-2", "mallory", config("evil"));
        let result = f.coordinator.modify(request).await;

        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
        assert_eq!(
            result.error_message.as_deref(),
            Some("automation not found: porch")
        );
        assert_eq!(f.versions.version_count(), 1);
    }

    #[tokio::test]
    async fn test_dependency_cycle_rejected() {
        let f = fixture();
        f.graph
            .add_dependency("garage", "porch", "home-1", "entity-shared")
            .unwrap();
        let mut change = config("one");
        change["depends_on"] = json!(["garage"]);

        let result = f
            .coordinator
            .modify(ModifyRequest::new("porch", "home-1", "alice", change))
            .await;

        assert_eq!(result.violations[0].rule, "dependency_cycle");
    }

    #[tokio::test]
    async fn test_rollback_to_previous() {
        let f = fixture();
        let v1 = f.coordinator.modify(modify("one")).await;
        f.coordinator.modify(modify("two")).await;

        let result = f
            .coordinator
            .rollback_to(RollbackRequest {
                automation_id: "porch".into(),
                connection_id: "home-1".into(),
                user_id: "alice".into(),
                target_version_id: None,
            })
            .await;

        assert!(result.success, "{result:?}");
        let latest = f.versions.latest("porch", "home-1").unwrap();
        let v1_id = v1.result_version_id.unwrap();
        assert_eq!(latest.sequence_number, 3);
        assert_eq!(latest.configuration, config("one"));
        assert_eq!(latest.change_summary, format!("rollback to {}", v1_id));

        let session = f.coordinator.session(result.session_id.as_deref().unwrap()).unwrap();
        assert_eq!(session.rollback_target_version_id, Some(v1_id));
    }

    #[tokio::test]
    async fn test_rollback_to_current_rejected() {
        let f = fixture();
        f.coordinator.modify(modify("one")).await;
        let current = f.coordinator.modify(modify("two")).await;

        let result = f
            .coordinator
            .rollback_to(RollbackRequest {
                automation_id: "porch".into(),
                connection_id: "home-1".into(),
                user_id: "alice".into(),
                target_version_id: current.result_version_id,
            })
            .await;

        assert_eq!(result.state, Some(ModificationState::Failed));
        assert_eq!(result.violations[0].rule, "rollback_to_current");
        assert_eq!(f.versions.version_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_idempotent() {
        let f = fixture();
        let done = f.coordinator.modify(modify("one")).await;

        for _ in 0..2 {
            let result = f.coordinator.cancel("porch", "alice", "home-1");
            assert!(result.success);
            assert_eq!(result.state, Some(ModificationState::Completed));
            assert_eq!(result.session_id, done.session_id);
        }

        let failed = f
            .coordinator
            .modify(ModifyRequest::new("porch", "home-1", "alice", json!({})))
            .await;
        let result = f.coordinator.cancel("porch", "alice", "home-1");
        assert!(result.success);
        assert_eq!(result.state, Some(ModificationState::Failed));
        assert_eq!(result.session_id, failed.session_id);
    }

    #[tokio::test]
    async fn test_cancel_without_session() {
        let f = fixture();
        let result = f.coordinator.cancel("porch", "alice", "home-1");
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_lock() {
        let f = Arc::new(fixture());
        f.coordinator.modify(modify("one")).await;

        let identity = AutomationIdentity::new("porch", "home-1");
        let guard = f.versions.apply_lock(&identity).await;

        let task = {
            let f = f.clone();
            tokio::spawn(async move { f.coordinator.modify(modify("two")).await })
        };
        // Wait until the session is parked on the lock
        for _ in 0..100 {
            if f
                .coordinator
                .active_sessions()
                .iter()
                .any(|s| s.state == ModificationState::Applying)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let cancelled = f.coordinator.cancel("porch", "alice", "home-1");
        assert!(cancelled.success);
        assert_eq!(cancelled.state, Some(ModificationState::Cancelled));
        drop(guard);

        let result = task.await.unwrap();
        assert!(!result.success);
        assert_eq!(result.state, Some(ModificationState::Cancelled));
        assert_eq!(f.versions.version_count(), 1);
        assert!(f.backups.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expires_and_purges() {
        let versions = Arc::new(VersionStore::new());
        let authoring: SharedAuthoring = Arc::new(NoopAuthoring);
        let backups = Arc::new(BackupVault::new(versions.clone(), authoring.clone()));
        let mut config = LifecycleConfig::default();
        config.sessions.terminal_retention_seconds = 0;
        let coordinator = ModificationCoordinator::new(
            versions.clone(),
            backups,
            Arc::new(DependencyGraph::new()),
            authoring,
            &config,
        );

        let identity = AutomationIdentity::new("porch", "home-1");
        let session_id = coordinator.open(
            &identity,
            "alice",
            json!({}),
            "stale".to_string(),
        );
        coordinator
            .update(&session_id, |s| s.expires_at = Utc::now() - chrono::Duration::seconds(1))
            .unwrap();

        let cleanup = coordinator.cleanup_expired();
        assert_eq!(cleanup.expired, vec![session_id.clone()]);
        assert_eq!(
            coordinator.session(&session_id).unwrap().state,
            ModificationState::Expired
        );
        assert_eq!(versions.version_count(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let cleanup = coordinator.cleanup_expired();
        assert_eq!(cleanup.purged, vec![session_id.clone()]);
        assert_eq!(coordinator.session_count(), 0);
        assert!(coordinator.session(&session_id).is_err());
        assert!(coordinator.cancel("porch", "alice", "home-1").error_kind == Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_cleanup_skips_in_flight_writes() {
        let f = fixture();
        let identity = AutomationIdentity::new("porch", "home-1");
        let session_id = f.coordinator.open(&identity, "alice", json!({}), "x".into());
        f.coordinator
            .update(&session_id, |s| {
                s.state = ModificationState::Applying;
                s.apply_in_flight = true;
                s.expires_at = Utc::now() - chrono::Duration::seconds(1);
            })
            .unwrap();
        let guard = f.versions.apply_lock(&identity).await;

        assert!(f.coordinator.cleanup_expired().expired.is_empty());

        // Cancel during the write is recorded, not applied
        let result = f.coordinator.cancel("porch", "alice", "home-1");
        assert!(!result.success);
        assert_eq!(result.state, Some(ModificationState::Applying));
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidState));
        assert!(f.coordinator.session(&session_id).unwrap().cancel_requested);

        // Once the lock is gone the session is treated as abandoned
        drop(guard);
        assert_eq!(f.coordinator.cleanup_expired().expired, vec![session_id.clone()]);
        let session = f.coordinator.session(&session_id).unwrap();
        assert_eq!(session.state, ModificationState::Expired);
        assert!(!session.apply_in_flight);
    }

    #[tokio::test]
    async fn test_cancel_abandoned_write() {
        let f = fixture();
        let identity = AutomationIdentity::new("porch", "home-1");
        let session_id = f.coordinator.open(&identity, "alice", json!({}), "x".into());
        f.coordinator
            .update(&session_id, |s| {
                s.state = ModificationState::Applying;
                s.apply_in_flight = true;
            })
            .unwrap();

        // No apply lock is held, so nothing is writing
        let result = f.coordinator.cancel("porch", "alice", "home-1");
        assert!(result.success);
        assert_eq!(result.state, Some(ModificationState::Cancelled));
        assert!(!f.coordinator.session(&session_id).unwrap().apply_in_flight);
    }

    #[tokio::test]
    async fn test_cancel_from_other_connection_is_not_found() {
        let f = fixture();
        let identity = AutomationIdentity::new("porch", "home-1");
        let session_id = f.coordinator.open(&identity, "alice", json!({}), "x".into());

        let result = f.coordinator.cancel("porch", "alice", "home-2");
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
        assert_eq!(
            result.error_message.as_deref(),
            Some("modification session not found: porch")
        );
        let session = f.coordinator.session(&session_id).unwrap();
        assert_eq!(session.state, ModificationState::Pending);
        assert!(!session.cancel_requested);
    }

    struct PanickingPush;

    #[async_trait::async_trait]
    impl ha_core::AutomationAuthoring for PanickingPush {
        async fn push_configuration(
            &self,
            _identity: &AutomationIdentity,
            _configuration: &serde_json::Value,
            _context: &Context,
        ) -> Result<(), ha_core::AuthoringError> {
            panic!("runtime connection dropped");
        }

        async fn retire(
            &self,
            _identity: &AutomationIdentity,
            _context: &Context,
        ) -> Result<(), ha_core::AuthoringError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fault_during_push_fails_session() {
        use futures::FutureExt;
        use std::panic::AssertUnwindSafe;

        let versions = Arc::new(VersionStore::new());
        let authoring: SharedAuthoring = Arc::new(PanickingPush);
        let backups = Arc::new(BackupVault::new(versions.clone(), authoring.clone()));
        let coordinator = ModificationCoordinator::new(
            versions.clone(),
            backups,
            Arc::new(DependencyGraph::new()),
            authoring,
            &LifecycleConfig::default(),
        );

        let outcome = AssertUnwindSafe(coordinator.modify(modify("one")))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());

        let session = coordinator.status("porch", "home-1").unwrap();
        assert_eq!(session.state, ModificationState::Failed);
        assert!(!session.apply_in_flight);
        assert_eq!(session.failure_reason.as_deref(), Some("internal error"));
        assert_eq!(session.failure_kind, Some(ErrorKind::Internal));
        assert!(coordinator.active_sessions().is_empty());
        assert!(!versions.is_applying(&session.identity()));
        assert_eq!(versions.version_count(), 0);

        // Cancel sees the stored terminal state
        let cancel = coordinator.cancel("porch", "alice", "home-1");
        assert!(cancel.success);
        assert_eq!(cancel.state, Some(ModificationState::Failed));
    }

    #[tokio::test]
    async fn test_status_is_scoped_to_connection() {
        let f = fixture();
        let result = f.coordinator.modify(modify("one")).await;

        assert_eq!(
            f.coordinator.status("porch", "home-1").unwrap().session_id,
            result.session_id.unwrap()
        );
        assert_eq!(
            f.coordinator.status("porch", "home-2").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
