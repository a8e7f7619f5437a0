//! Retirement Coordinator
//!
//! ```text
//! initiate ─► Initiated ─► resolve dependents
//!                  ├─ blocked, not forced ─► Blocked ─(resume)─┐
//!                  └─ clear or forced ─────────────────────────┴─► Resolving
//!                                                                  │ backup
//!                                                                  │ authoring retire
//!                                                                  │ tombstone append
//!                                                                  ▼
//!                                                               Retired
//! ```
//!
//! A retired automation can only come back through an explicit backup
//! restore, which appends a fresh version; the retirement record stays.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use ha_backups::BackupVault;
use ha_config::{ApplyConfig, LifecycleConfig, RetirementConfig};
use ha_core::events::AutomationRetiredData;
use ha_core::{
    within_budget, AutomationDependency, AutomationIdentity, Context, LifecycleError,
    LifecycleResult, NewVersion, SharedAuthoring,
};
use ha_dependencies::{DependencyGraph, RetirementResolution};
use ha_event_bus::EventBus;
use ha_versioning::VersionStore;
use tracing::{debug, error, info, instrument, warn};

use crate::api::{RetireRequest, RetirementResult};
use crate::session::{RetirementRequest, RetirementState};

/// Change summary of every tombstone version
pub const TOMBSTONE_SUMMARY: &str = "retired";

/// Coordinates automation retirement
pub struct RetirementCoordinator {
    versions: Arc<VersionStore>,
    backups: Arc<BackupVault>,
    graph: Arc<DependencyGraph>,
    authoring: SharedAuthoring,
    event_bus: Option<Arc<EventBus>>,

    /// Primary index: retirement_id -> request
    requests: DashMap<String, RetirementRequest>,
    /// Index: automation_id -> most recent retirement_id
    by_automation: DashMap<String, String>,

    retirement_config: RetirementConfig,
    apply_config: ApplyConfig,
}

impl RetirementCoordinator {
    pub fn new(
        versions: Arc<VersionStore>,
        backups: Arc<BackupVault>,
        graph: Arc<DependencyGraph>,
        authoring: SharedAuthoring,
        config: &LifecycleConfig,
    ) -> Self {
        Self {
            versions,
            backups,
            graph,
            authoring,
            event_bus: None,
            requests: DashMap::new(),
            by_automation: DashMap::new(),
            retirement_config: config.retirement.clone(),
            apply_config: config.apply.clone(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Start retiring an automation
    ///
    /// Dependents block the retirement unless it is forced; a blocked
    /// request is a normal outcome (`success = false`, kind
    /// `dependency_blocked`). A newer request supersedes an open one.
    #[instrument(skip(self, request), fields(
        automation_id = %request.automation_id,
        connection_id = %request.connection_id,
        user_id = %request.user_id,
        force = request.force_retirement,
    ))]
    pub async fn initiate(&self, request: RetireRequest) -> RetirementResult {
        let identity = AutomationIdentity::new(&request.automation_id, &request.connection_id);
        match self
            .versions
            .latest(&identity.automation_id, &identity.connection_id)
        {
            Ok(current) if current.tombstone => {
                return RetirementResult::from_error(&LifecycleError::InvalidState(format!(
                    "automation {} is already retired",
                    identity.automation_id
                )))
            }
            Ok(_) => {}
            Err(err) => return RetirementResult::from_error(&err),
        }

        let retirement = RetirementRequest::new(
            &identity,
            &request.user_id,
            request.force_retirement,
        );
        let retirement_id = retirement.retirement_id.clone();
        self.supersede(&identity.automation_id, &retirement_id);
        self.requests.insert(retirement_id.clone(), retirement);
        self.by_automation
            .insert(identity.automation_id.clone(), retirement_id.clone());
        debug!(retirement_id = %retirement_id, "Initiated retirement");

        self.evaluate(&retirement_id).await
    }

    /// Re-check a blocked request, e.g. after blocking edges were removed
    ///
    /// Only the user who initiated the request may resume it.
    #[instrument(skip(self))]
    pub async fn resume(
        &self,
        automation_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> RetirementResult {
        let request = match self.owned(automation_id, user_id, connection_id) {
            Ok(request) => request,
            Err(err) => return RetirementResult::from_error(&err),
        };
        if request.state != RetirementState::Blocked {
            return RetirementResult::from_error(&LifecycleError::InvalidState(format!(
                "retirement {} is {}, only blocked requests can be resumed",
                request.retirement_id, request.state
            )));
        }
        debug!(retirement_id = %request.retirement_id, "Resuming retirement");
        self.evaluate(&request.retirement_id).await
    }

    /// Cancel any open request for the automation
    fn supersede(&self, automation_id: &str, new_retirement_id: &str) {
        let Some(previous) = self.by_automation.get(automation_id).map(|r| r.value().clone())
        else {
            return;
        };
        if let Some(mut old) = self.requests.get_mut(&previous) {
            if old.state.is_open() && old.transition(RetirementState::Cancelled).is_ok() {
                old.failure_reason = Some(format!("superseded by {}", new_retirement_id));
                info!(
                    retirement_id = %previous,
                    superseded_by = new_retirement_id,
                    "Superseded open retirement request"
                );
            }
        }
    }

    async fn evaluate(&self, retirement_id: &str) -> RetirementResult {
        let mut guard = AbortOnDrop {
            coordinator: self,
            retirement_id,
            armed: true,
        };
        let outcome = match self.resolve(retirement_id) {
            Ok(resolution) if resolution.can_proceed => self.apply(retirement_id).await,
            Ok(_) => self
                .update(retirement_id, |r| match r.state {
                    RetirementState::Blocked => Ok(()),
                    _ => r.transition(RetirementState::Blocked),
                })
                .and_then(|t| t.map_err(|e| LifecycleError::InvalidState(e.to_string()))),
            Err(err) => Err(err),
        };
        guard.armed = false;

        if let Err(err) = outcome {
            match err.kind() {
                ha_core::ErrorKind::Internal => {
                    error!(retirement_id, error = %err, "Retirement failed")
                }
                _ => warn!(retirement_id, error = %err, "Retirement did not complete"),
            }
            self.abort(retirement_id, &err);
        }

        match self.request(retirement_id) {
            Ok(request) => {
                if request.state == RetirementState::Blocked {
                    info!(
                        retirement_id,
                        blocking = request.blocking_dependency_ids.len(),
                        "Retirement blocked by dependents"
                    );
                }
                RetirementResult::from_request(&request)
            }
            Err(err) => RetirementResult::from_error(&err),
        }
    }

    fn resolve(&self, retirement_id: &str) -> LifecycleResult<RetirementResolution> {
        let request = self.request(retirement_id)?;
        let resolution = self.graph.resolve_for_retirement(
            &request.automation_id,
            &request.connection_id,
            request.force_retirement,
        )?;
        self.update(retirement_id, |r| {
            r.blocking_dependency_ids = resolution.blocking_dependency_ids.clone();
            r.blocking_automation_ids = resolution.blocking_automation_ids.clone();
        })?;
        Ok(resolution)
    }

    async fn apply(&self, retirement_id: &str) -> LifecycleResult<()> {
        self.update(retirement_id, |r| r.transition(RetirementState::Resolving))?
            .map_err(|e| LifecycleError::InvalidState(e.to_string()))?;

        let request = self.request(retirement_id)?;
        let identity = request.identity();
        let automation_id = identity.automation_id.as_str();
        let connection_id = identity.connection_id.as_str();

        let _guard = self.versions.apply_lock(&identity).await;
        let current = self.versions.latest(automation_id, connection_id)?;
        if current.tombstone {
            return Err(LifecycleError::InvalidState(format!(
                "automation {} was retired concurrently",
                automation_id
            )));
        }

        let backup = self.backups.create(
            automation_id,
            connection_id,
            current.configuration.clone(),
            "pre-retirement",
        )?;
        self.update(retirement_id, |r| r.backup_id = Some(backup.backup_id.clone()))?;

        let context = Context::for_user(&request.user_id, connection_id);
        within_budget(
            "retire",
            self.apply_config.authoring_timeout(),
            self.authoring.retire(&identity, &context),
        )
        .await?;

        let tombstone = NewVersion::new(
            identity.clone(),
            current.configuration,
            &request.user_id,
            TOMBSTONE_SUMMARY,
        )
        .with_parent(Some(current.version_id))
        .as_tombstone();
        let version = self
            .versions
            .append_next(&tombstone, self.apply_config.sequence_conflict_retries)?;

        self.update(retirement_id, |r| {
            r.tombstone_version_id = Some(version.version_id.clone());
            r.transition(RetirementState::Retired)
        })?
        .map_err(|e| LifecycleError::InvalidState(e.to_string()))?;

        info!(
            retirement_id,
            tombstone_version_id = %version.version_id,
            forced = request.force_retirement,
            "Automation retired"
        );

        if let Some(bus) = &self.event_bus {
            bus.publish(
                AutomationRetiredData {
                    automation_id: identity.automation_id.clone(),
                    connection_id: identity.connection_id.clone(),
                    retirement_id: retirement_id.to_string(),
                    tombstone_version_id: version.version_id,
                    forced: request.force_retirement,
                    blocking_dependency_ids: request.blocking_dependency_ids,
                },
                context,
            );
        }
        Ok(())
    }

    /// Record a failure; a request that was not retired ends up cancelled
    fn abort(&self, retirement_id: &str, err: &LifecycleError) {
        let _ = self.update(retirement_id, |r| {
            if r.state.is_terminal() {
                return;
            }
            r.failure_reason = Some(err.public_message());
            r.failure_kind = Some(err.kind());
            if let Err(invalid) = r.transition(RetirementState::Cancelled) {
                warn!(retirement_id = %r.retirement_id, error = %invalid, "Could not cancel retirement");
            }
        });
    }

    fn update<R>(
        &self,
        retirement_id: &str,
        f: impl FnOnce(&mut RetirementRequest) -> R,
    ) -> LifecycleResult<R> {
        let mut request = self
            .requests
            .get_mut(retirement_id)
            .ok_or_else(|| LifecycleError::not_found("retirement request", retirement_id))?;
        Ok(f(&mut request))
    }

    pub fn request(&self, retirement_id: &str) -> LifecycleResult<RetirementRequest> {
        self.requests
            .get(retirement_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| LifecycleError::not_found("retirement request", retirement_id))
    }

    /// Latest retirement request for an automation
    pub fn status(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<RetirementRequest> {
        let retirement_id = self
            .by_automation
            .get(automation_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| LifecycleError::not_found("retirement request", automation_id))?;
        let request = self.request(&retirement_id)?;
        if request.connection_id != connection_id {
            return Err(LifecycleError::cross_tenant(
                "retirement request",
                automation_id,
                connection_id,
            ));
        }
        Ok(request)
    }

    /// The latest request, visible to its initiator only
    fn owned(
        &self,
        automation_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<RetirementRequest> {
        let request = self.status(automation_id, connection_id)?;
        if request.user_id != user_id {
            return Err(LifecycleError::not_found("retirement request", automation_id));
        }
        Ok(request)
    }

    /// Cancel the initiator's latest request while it is initiated or blocked
    ///
    /// Cancelling an already cancelled request is a no-op success. A retired
    /// automation cannot be un-retired here.
    #[instrument(skip(self))]
    pub fn cancel(
        &self,
        automation_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> RetirementResult {
        let request = match self.owned(automation_id, user_id, connection_id) {
            Ok(request) => request,
            Err(err) => return RetirementResult::from_error(&err),
        };

        let cancelled = self.update(&request.retirement_id, |r| match r.state {
            RetirementState::Cancelled => Ok(false),
            // Only an apply failure may cancel a resolving request
            RetirementState::Resolving => Err("retirement is already being applied"),
            _ => r
                .transition(RetirementState::Cancelled)
                .map(|_| true)
                .map_err(|invalid| invalid.reason),
        });

        match cancelled {
            Ok(Ok(changed)) => {
                if changed {
                    info!(retirement_id = %request.retirement_id, "Cancelled retirement");
                }
                match self.request(&request.retirement_id) {
                    Ok(request) => RetirementResult::from_request(&request).succeeded(),
                    Err(err) => RetirementResult::from_error(&err),
                }
            }
            Ok(Err(reason)) => {
                let err = LifecycleError::InvalidState(format!(
                    "retirement {} cannot be cancelled: {}",
                    request.retirement_id, reason
                ));
                RetirementResult {
                    retirement_id: Some(request.retirement_id.clone()),
                    state: Some(request.state),
                    ..RetirementResult::from_error(&err)
                }
            }
            Err(err) => RetirementResult::from_error(&err),
        }
    }

    /// Evict requests that outlived the request TTL
    ///
    /// Open and terminal requests are removed once older than the TTL. A
    /// request still resolving past the TTL without holding the apply lock
    /// was abandoned; it is cancelled here and evicted on a later pass.
    /// Versions, backups and edges are never touched.
    pub fn cleanup_expired(&self) -> Vec<String> {
        // A TTL reaching past the earliest representable instant evicts nothing
        let Some(cutoff) = Utc::now().checked_sub_signed(self.retirement_config.request_ttl())
        else {
            return Vec::new();
        };

        let abandoned: Vec<String> = self
            .requests
            .iter()
            .filter(|r| {
                r.state == RetirementState::Resolving
                    && r.updated_at < cutoff
                    && !self.versions.is_applying(&r.identity())
            })
            .map(|r| r.key().clone())
            .collect();
        for retirement_id in &abandoned {
            warn!(retirement_id = %retirement_id, "Cancelling abandoned retirement");
            self.abort(
                retirement_id,
                &LifecycleError::Internal("retirement abandoned while resolving".into()),
            );
        }

        let evictable = |r: &RetirementRequest| {
            (r.state.is_open() && r.created_at < cutoff)
                || (r.state.is_terminal() && r.updated_at < cutoff)
        };
        let stale: Vec<String> = self
            .requests
            .iter()
            .filter(|r| evictable(r.value()))
            .map(|r| r.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for retirement_id in stale {
            if self
                .requests
                .remove_if(&retirement_id, |_, r| evictable(r))
                .is_some()
            {
                removed.push(retirement_id);
            }
        }
        if !removed.is_empty() {
            self.by_automation
                .retain(|_, id| self.requests.contains_key(id));
            info!(removed = removed.len(), "Removed stale retirement requests");
        }
        removed
    }

    /// Sever a dependency edge while resolving a blocked retirement
    pub fn remove_dependency(
        &self,
        dependency_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<AutomationDependency> {
        self.graph.remove_dependency(dependency_id, connection_id)
    }

    /// Requests that are initiated or blocked
    pub fn open_requests(&self) -> Vec<RetirementRequest> {
        self.requests
            .iter()
            .filter(|r| r.state.is_open())
            .map(|r| r.value().clone())
            .collect()
    }
}

/// Cancels the request if the pipeline unwinds or is dropped mid-flight
struct AbortOnDrop<'a> {
    coordinator: &'a RetirementCoordinator,
    retirement_id: &'a str,
    armed: bool,
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            error!(retirement_id = self.retirement_id, "Retirement pipeline aborted");
            self.coordinator.abort(
                self.retirement_id,
                &LifecycleError::Internal("retirement pipeline aborted".into()),
            );
        }
    }
}
