//! Automation Lifecycle Service
//!
//! The single entry point handed to a transport layer. It wires the version
//! ledger, backup vault, dependency graph and both coordinators together and
//! is the boundary where unexpected faults (including panics inside a
//! pipeline) are caught, logged and turned into a redacted failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use ha_backups::{BackupVault, RestoreOutcome};
use ha_config::LifecycleConfig;
use ha_core::{
    AutomationBackup, AutomationDependency, LifecycleError, LifecycleResult, SharedAuthoring,
};
use ha_dependencies::{DependencyAnalysis, DependencyGraph};
use ha_event_bus::EventBus;
use ha_storage::{Storage, StorageResult};
use ha_versioning::{VersionDiffResult, VersionStatistics, VersionStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::api::{
    DiffRequest, HistoryRequest, HistoryResponse, ModificationResult, ModifyRequest,
    RestoreRequest, RetireRequest, RetirementResult, RollbackRequest,
};
use crate::modification::ModificationCoordinator;
use crate::retirement::RetirementCoordinator;
use crate::session::{ModificationState, RetirementRequest};

/// Everything removed by one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub expired_sessions: usize,
    pub purged_sessions: usize,
    pub removed_retirements: usize,
    pub pruned_versions: usize,
    pub pruned_backups: usize,
    pub released_locks: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == CleanupReport::default()
    }
}

/// Counters for dashboards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleHealth {
    pub automations: usize,
    pub versions: usize,
    pub retired_automations: usize,
    pub backups: usize,
    pub dependencies: usize,
    pub active_sessions: usize,
    pub applies_in_progress: usize,
    pub open_retirements: usize,
    pub events_published: u64,
}

/// Facade over the whole lifecycle core
pub struct AutomationLifecycle {
    config: LifecycleConfig,
    event_bus: Arc<EventBus>,
    versions: Arc<VersionStore>,
    backups: Arc<BackupVault>,
    graph: Arc<DependencyGraph>,
    modifications: ModificationCoordinator,
    retirements: RetirementCoordinator,
}

impl AutomationLifecycle {
    pub fn new(config: LifecycleConfig, authoring: SharedAuthoring) -> Self {
        Self::with_event_bus(config, authoring, Arc::new(EventBus::new()))
    }

    pub fn with_event_bus(
        config: LifecycleConfig,
        authoring: SharedAuthoring,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let versions = Arc::new(VersionStore::new().with_event_bus(event_bus.clone()));
        let backups = Arc::new(
            BackupVault::new(versions.clone(), authoring.clone())
                .with_event_bus(event_bus.clone())
                .with_apply_settings(
                    config.apply.authoring_timeout(),
                    config.apply.sequence_conflict_retries,
                ),
        );
        let graph = Arc::new(DependencyGraph::new().with_limits(
            config.dependencies.max_traversal_depth,
            config.dependencies.traversal_budget(),
        ));
        let modifications = ModificationCoordinator::new(
            versions.clone(),
            backups.clone(),
            graph.clone(),
            authoring.clone(),
            &config,
        );
        let retirements = RetirementCoordinator::new(
            versions.clone(),
            backups.clone(),
            graph.clone(),
            authoring,
            &config,
        )
        .with_event_bus(event_bus.clone());

        Self {
            config,
            event_bus,
            versions,
            backups,
            graph,
            modifications,
            retirements,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    pub fn backups(&self) -> &Arc<BackupVault> {
        &self.backups
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn modifications(&self) -> &ModificationCoordinator {
        &self.modifications
    }

    pub fn retirements(&self) -> &RetirementCoordinator {
        &self.retirements
    }

    /// Run `operation`, turning a panic into `on_fault(internal error)`
    async fn guarded<T, F>(
        &self,
        operation: &'static str,
        future: F,
        on_fault: impl FnOnce(&LifecycleError) -> T,
    ) -> T
    where
        F: Future<Output = T>,
    {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(operation, panic = %detail, "Unexpected fault in lifecycle pipeline");
                on_fault(&LifecycleError::Internal(detail))
            }
        }
    }

    pub async fn modify(&self, request: ModifyRequest) -> ModificationResult {
        self.guarded(
            "modify",
            self.modifications.modify(request),
            failed_modification,
        )
        .await
    }

    pub async fn rollback_to(&self, request: RollbackRequest) -> ModificationResult {
        self.guarded(
            "rollback",
            self.modifications.rollback_to(request),
            failed_modification,
        )
        .await
    }

    pub fn cancel_modification(
        &self,
        automation_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> ModificationResult {
        self.modifications
            .cancel(automation_id, user_id, connection_id)
    }

    pub async fn retire(&self, request: RetireRequest) -> RetirementResult {
        self.guarded(
            "retire",
            self.retirements.initiate(request),
            RetirementResult::from_error,
        )
        .await
    }

    pub async fn resume_retirement(
        &self,
        automation_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> RetirementResult {
        self.guarded(
            "resume_retirement",
            self.retirements.resume(automation_id, user_id, connection_id),
            RetirementResult::from_error,
        )
        .await
    }

    pub fn cancel_retirement(
        &self,
        automation_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> RetirementResult {
        self.retirements.cancel(automation_id, user_id, connection_id)
    }

    pub fn retirement_status(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<RetirementRequest> {
        self.retirements.status(automation_id, connection_id)
    }

    /// One page of history; the page size is capped by configuration
    pub fn history(&self, request: HistoryRequest) -> HistoryResponse {
        let page_size = request.page_size.min(self.config.history.max_page_size);
        match self.versions.history(
            &request.automation_id,
            &request.connection_id,
            request.page_number,
            page_size,
        ) {
            Ok(page) => page.into(),
            Err(err) => {
                debug!(automation_id = %request.automation_id, error = %err, "History lookup failed");
                HistoryResponse::from_error(&request, &err)
            }
        }
    }

    pub fn diff(&self, request: DiffRequest) -> LifecycleResult<VersionDiffResult> {
        self.versions.diff_scoped(
            &request.version_id_1,
            &request.version_id_2,
            &request.connection_id,
        )
    }

    pub fn statistics(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<VersionStatistics> {
        self.versions.statistics(automation_id, connection_id)
    }

    pub async fn restore_backup(&self, request: RestoreRequest) -> LifecycleResult<RestoreOutcome> {
        self.guarded(
            "restore_backup",
            self.backups
                .restore(&request.backup_id, &request.user_id, &request.connection_id),
            |err| Err(err.clone()),
        )
        .await
    }

    /// Backups of an automation, newest first
    pub fn list_backups(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<Vec<AutomationBackup>> {
        if let Some(owner) = self.versions.connection_of(automation_id) {
            if owner != connection_id {
                return Err(LifecycleError::cross_tenant(
                    "automation",
                    automation_id,
                    connection_id,
                ));
            }
        }
        Ok(self
            .backups
            .list_for(automation_id)
            .into_iter()
            .filter(|b| b.connection_id == connection_id)
            .collect())
    }

    pub fn add_dependency(
        &self,
        source_automation_id: &str,
        target_automation_id: &str,
        connection_id: &str,
        dependency_type: &str,
    ) -> LifecycleResult<AutomationDependency> {
        self.graph.add_dependency(
            source_automation_id,
            target_automation_id,
            connection_id,
            dependency_type,
        )
    }

    pub fn remove_dependency(
        &self,
        dependency_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<AutomationDependency> {
        self.retirements
            .remove_dependency(dependency_id, connection_id)
    }

    pub fn analyze_dependencies(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> DependencyAnalysis {
        self.graph.analyze_dependencies(automation_id, connection_id)
    }

    /// Expire sessions and requests, then apply the retention policies
    ///
    /// Safe to run concurrently with anything else; a second pass right after
    /// the first removes nothing. A fault inside the sweep is logged and
    /// reported as an empty pass so a periodic sweeper keeps running.
    pub fn cleanup_expired(&self) -> CleanupReport {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.sweep())) {
            Ok(report) => report,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                error!(operation = "cleanup", panic = %detail, "Unexpected fault in lifecycle pipeline");
                CleanupReport::default()
            }
        }
    }

    fn sweep(&self) -> CleanupReport {
        let sessions = self.modifications.cleanup_expired();
        let retirements = self.retirements.cleanup_expired();

        let retention = &self.config.retention;
        let mut pruned_versions = 0;
        for automation_id in self.versions.automation_ids() {
            pruned_versions += self
                .versions
                .prune_older_than(&automation_id, retention.max_versions_per_automation)
                .len();
            if let Some(max_age) = retention.max_version_age() {
                pruned_versions += self.versions.prune_by_age(&automation_id, max_age).len();
            }
        }

        let mut pruned_backups = self
            .backups
            .prune_older_than(retention.max_backups_per_automation)
            .len();
        if let Some(max_age) = retention.max_backup_age() {
            pruned_backups += self.backups.prune_by_age(max_age).len();
        }

        let report = CleanupReport {
            expired_sessions: sessions.expired.len(),
            purged_sessions: sessions.purged.len(),
            removed_retirements: retirements.len(),
            pruned_versions,
            pruned_backups,
            released_locks: self.versions.release_idle_locks(),
        };
        if !report.is_empty() {
            info!(?report, "Lifecycle cleanup finished");
        }
        report
    }

    pub fn health(&self) -> LifecycleHealth {
        LifecycleHealth {
            automations: self.versions.automation_count(),
            versions: self.versions.version_count(),
            retired_automations: self.versions.retired_count(),
            backups: self.backups.len(),
            dependencies: self.graph.len(),
            active_sessions: self.modifications.active_sessions().len(),
            applies_in_progress: self.versions.applying_count(),
            open_retirements: self.retirements.open_requests().len(),
            events_published: self.event_bus.published_count(),
        }
    }

    /// Load versions, backups and dependencies from `.storage/`
    pub async fn load(&self, storage: &Storage) -> StorageResult<()> {
        let versions = self.versions.load(storage).await?;
        let backups = self.backups.load(storage).await?;
        let dependencies = self.graph.load(storage).await?;
        info!(versions, backups, dependencies, "Loaded automation lifecycle state");
        Ok(())
    }

    /// Flush versions, backups and dependencies to `.storage/`
    pub async fn save(&self, storage: &Storage) -> StorageResult<()> {
        self.versions.save(storage).await?;
        self.backups.save(storage).await?;
        self.graph.save(storage).await?;
        Ok(())
    }
}

fn failed_modification(err: &LifecycleError) -> ModificationResult {
    ModificationResult {
        state: Some(ModificationState::Failed),
        ..ModificationResult::from_error(err)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
