//! Backup storage, restore and retention

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ha_core::events::BackupRestoredData;
use ha_core::{
    within_budget, AutomationBackup, AutomationIdentity, AutomationVersion, Configuration,
    Context, LifecycleError, LifecycleResult, NewVersion, SharedAuthoring,
};
use ha_event_bus::EventBus;
use ha_storage::{Storable, Storage, StorageResult};
use ha_versioning::VersionStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// Storage key for the backup snapshot
pub const STORAGE_KEY: &str = "automation_lifecycle.backups";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Persisted form of the vault
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub backups: Vec<AutomationBackup>,
}

impl Storable for BackupSnapshot {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Result of restoring a backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    /// The version recorded for the restore
    pub version: AutomationVersion,
    /// Safety backup of the configuration that was replaced, if any
    pub safety_backup_id: Option<String>,
}

/// Store of backup snapshots
pub struct BackupVault {
    /// Primary index: backup_id -> backup
    backups: DashMap<String, AutomationBackup>,
    /// Index: automation_id -> backup ids, oldest first
    by_automation: DashMap<String, Vec<String>>,
    versions: Arc<VersionStore>,
    authoring: SharedAuthoring,
    event_bus: Option<Arc<EventBus>>,
    authoring_timeout: Duration,
    sequence_conflict_retries: u32,
}

impl BackupVault {
    pub fn new(versions: Arc<VersionStore>, authoring: SharedAuthoring) -> Self {
        Self {
            backups: DashMap::new(),
            by_automation: DashMap::new(),
            versions,
            authoring,
            event_bus: None,
            authoring_timeout: Duration::from_secs(5),
            sequence_conflict_retries: 3,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Tune the restore pipeline
    pub fn with_apply_settings(mut self, authoring_timeout: Duration, retries: u32) -> Self {
        self.authoring_timeout = authoring_timeout;
        self.sequence_conflict_retries = retries;
        self
    }

    fn index(&self, backup: AutomationBackup) {
        let automation_id = backup.automation_id.clone();
        let backup_id = backup.backup_id.clone();
        self.backups.insert(backup_id.clone(), backup);
        self.by_automation
            .entry(automation_id)
            .or_default()
            .push(backup_id);
    }

    /// Take a snapshot of a configuration
    ///
    /// The snapshot records the automation's latest version (if any) so the
    /// backup can be related back to the ledger later.
    pub fn create(
        &self,
        automation_id: &str,
        connection_id: &str,
        configuration: Configuration,
        reason: &str,
    ) -> LifecycleResult<AutomationBackup> {
        if let Some(owner) = self.versions.connection_of(automation_id) {
            if owner != connection_id {
                return Err(LifecycleError::cross_tenant(
                    "automation",
                    automation_id,
                    connection_id,
                ));
            }
        }

        let source_version_id = self
            .versions
            .latest(automation_id, connection_id)
            .ok()
            .map(|v| v.version_id);
        let backup = AutomationBackup::new(automation_id, connection_id, configuration, reason)
            .with_source_version(source_version_id);

        self.index(backup.clone());
        debug!(
            automation_id,
            backup_id = %backup.backup_id,
            reason,
            "Created backup"
        );
        Ok(backup)
    }

    pub fn get(&self, backup_id: &str) -> LifecycleResult<AutomationBackup> {
        self.backups
            .get(backup_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| LifecycleError::not_found("backup", backup_id))
    }

    /// Backups of an automation, newest first
    pub fn list_for(&self, automation_id: &str) -> Vec<AutomationBackup> {
        self.by_automation
            .get(automation_id)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .filter_map(|id| self.backups.get(id).map(|r| r.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Restore a backup as a new version
    ///
    /// Runs under the automation's apply lock. The configuration being
    /// replaced is itself backed up first (`pre-restore`). The source backup
    /// is never modified or deleted.
    #[instrument(skip(self), fields(automation_id))]
    pub async fn restore(
        &self,
        backup_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<RestoreOutcome> {
        let backup = self.get(backup_id)?;
        if backup.connection_id != connection_id {
            return Err(LifecycleError::cross_tenant(
                "backup",
                backup_id,
                connection_id,
            ));
        }
        tracing::Span::current().record("automation_id", backup.automation_id.as_str());

        let identity = AutomationIdentity::new(&backup.automation_id, &backup.connection_id);
        let context = Context::for_user(user_id, connection_id);
        let _guard = self.versions.apply_lock(&identity).await;

        let safety_backup_id = match self.versions.latest(&identity.automation_id, connection_id) {
            Ok(current) => Some(
                self.create(
                    &identity.automation_id,
                    connection_id,
                    current.configuration,
                    "pre-restore",
                )?
                .backup_id,
            ),
            Err(_) => None,
        };

        within_budget(
            "push_configuration",
            self.authoring_timeout,
            self.authoring
                .push_configuration(&identity, &backup.snapshot_configuration, &context),
        )
        .await
        .map_err(|err| {
            warn!(backup_id, error = %err, "Restore push failed");
            err
        })?;

        let draft = NewVersion::new(
            identity.clone(),
            backup.snapshot_configuration.clone(),
            user_id,
            format!("restored from backup {}", backup_id),
        );
        let version = self
            .versions
            .append_next(&draft, self.sequence_conflict_retries)?;

        info!(
            backup_id,
            version_id = %version.version_id,
            sequence = version.sequence_number,
            "Restored automation from backup"
        );

        if let Some(bus) = &self.event_bus {
            bus.publish(
                BackupRestoredData {
                    automation_id: identity.automation_id.clone(),
                    connection_id: identity.connection_id.clone(),
                    backup_id: backup_id.to_string(),
                    version_id: version.version_id.clone(),
                },
                context,
            );
        }

        Ok(RestoreOutcome {
            version,
            safety_backup_id,
        })
    }

    /// Delete a backup
    pub fn delete(&self, backup_id: &str) -> LifecycleResult<AutomationBackup> {
        let (_, backup) = self
            .backups
            .remove(backup_id)
            .ok_or_else(|| LifecycleError::not_found("backup", backup_id))?;
        if let Some(mut ids) = self.by_automation.get_mut(&backup.automation_id) {
            ids.retain(|id| id != backup_id);
        }
        info!(backup_id, automation_id = %backup.automation_id, "Deleted backup");
        Ok(backup)
    }

    /// Keep at most `max_backups_per_automation` per automation, dropping the oldest
    pub fn prune_older_than(&self, max_backups_per_automation: usize) -> Vec<String> {
        let mut removed = Vec::new();
        for mut entry in self.by_automation.iter_mut() {
            let excess = entry.len().saturating_sub(max_backups_per_automation);
            removed.extend(entry.drain(..excess));
        }
        self.forget(removed, "count cap")
    }

    /// Drop every backup older than `max_age`
    pub fn prune_by_age(&self, max_age: chrono::Duration) -> Vec<String> {
        // An age reaching past the earliest representable instant prunes nothing
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for mut entry in self.by_automation.iter_mut() {
            let expired = entry
                .iter()
                .take_while(|id| {
                    self.backups
                        .get(*id)
                        .map(|b| b.created_at < cutoff)
                        .unwrap_or(true)
                })
                .count();
            removed.extend(entry.drain(..expired));
        }
        self.forget(removed, "age limit")
    }

    fn forget(&self, removed: Vec<String>, policy: &str) -> Vec<String> {
        for id in &removed {
            self.backups.remove(id);
        }
        self.by_automation.retain(|_, ids| !ids.is_empty());
        if !removed.is_empty() {
            info!(removed = removed.len(), policy, "Pruned backups");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    pub fn export_snapshot(&self) -> BackupSnapshot {
        let mut backups = Vec::with_capacity(self.backups.len());
        for entry in self.by_automation.iter() {
            backups.extend(
                entry
                    .iter()
                    .filter_map(|id| self.backups.get(id).map(|r| r.value().clone())),
            );
        }
        BackupSnapshot { backups }
    }

    /// Merge a snapshot; backups already present are skipped
    pub fn import_snapshot(&self, snapshot: BackupSnapshot) -> usize {
        let mut backups = snapshot.backups;
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut imported = 0;
        for backup in backups {
            if self.backups.contains_key(&backup.backup_id) {
                continue;
            }
            self.index(backup);
            imported += 1;
        }
        imported
    }

    pub async fn save(&self, storage: &Storage) -> StorageResult<()> {
        storage.save(&self.export_snapshot()).await?;
        debug!("Saved {} backups to storage", self.len());
        Ok(())
    }

    pub async fn load(&self, storage: &Storage) -> StorageResult<usize> {
        let Some(snapshot) = storage.load::<BackupSnapshot>().await? else {
            return Ok(0);
        };
        let imported = self.import_snapshot(snapshot);
        info!("Loaded {} backups from storage", imported);
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ha_core::{AuthoringError, AutomationAuthoring, ErrorKind, NoopAuthoring};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct RecordingAuthoring {
        pushes: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AutomationAuthoring for RecordingAuthoring {
        async fn push_configuration(
            &self,
            _identity: &AutomationIdentity,
            _configuration: &Configuration,
            _context: &Context,
        ) -> Result<(), AuthoringError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AuthoringError::Unavailable("runtime offline".into()))
            } else {
                Ok(())
            }
        }

        async fn retire(
            &self,
            _identity: &AutomationIdentity,
            _context: &Context,
        ) -> Result<(), AuthoringError> {
            Ok(())
        }
    }

    fn test_vault() -> (Arc<VersionStore>, BackupVault) {
        let versions = Arc::new(VersionStore::new());
        let vault = BackupVault::new(versions.clone(), Arc::new(NoopAuthoring));
        (versions, vault)
    }

    fn seed_version(
        versions: &VersionStore,
        automation_id: &str,
        config: Configuration,
    ) -> AutomationVersion {
        versions
            .append_next(
                &NewVersion::new(
                    AutomationIdentity::new(automation_id, "home-1"),
                    config,
                    "alice",
                    "created",
                ),
                0,
            )
            .unwrap()
    }

    #[test]
    fn test_create_get_and_list_newest_first() {
        let (versions, vault) = test_vault();
        let v1 = seed_version(&versions, "a1", json!({"alias": "one"}));

        let first = vault.create("a1", "home-1", json!({"n": 1}), "manual").unwrap();
        let second = vault.create("a1", "home-1", json!({"n": 2}), "manual").unwrap();
        vault.create("a2", "home-1", json!({"n": 3}), "manual").unwrap();

        assert_eq!(vault.get(&first.backup_id).unwrap(), first);
        assert_eq!(first.source_version_id.as_deref(), Some(v1.version_id.as_str()));

        let listed: Vec<String> = vault.list_for("a1").into_iter().map(|b| b.backup_id).collect();
        assert_eq!(listed, vec![second.backup_id, first.backup_id]);
        assert!(vault.list_for("unknown").is_empty());
    }

    #[test]
    fn test_create_for_other_connection_rejected() {
        let (versions, vault) = test_vault();
        seed_version(&versions, "a1", json!({}));

        let err = vault.create("a1", "home-2", json!({}), "manual").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(vault.is_empty());
    }

    #[tokio::test]
    async fn test_restore_appends_parentless_version_and_keeps_backup() {
        let (versions, vault) = test_vault();
        seed_version(&versions, "a1", json!({"alias": "original"}));
        let backup = vault
            .create("a1", "home-1", json!({"alias": "original"}), "manual")
            .unwrap();
        seed_version(&versions, "a1", json!({"alias": "broken"}));

        let outcome = vault.restore(&backup.backup_id, "bob", "home-1").await.unwrap();

        assert_eq!(outcome.version.sequence_number, 3);
        assert_eq!(outcome.version.parent_version_id, None);
        assert_eq!(
            outcome.version.change_summary,
            format!("restored from backup {}", backup.backup_id)
        );
        assert_eq!(outcome.version.author_name, "bob");
        assert_eq!(outcome.version.configuration, json!({"alias": "original"}));

        // Source backup untouched, safety backup holds the replaced config
        assert_eq!(vault.get(&backup.backup_id).unwrap(), backup);
        let safety = vault.get(&outcome.safety_backup_id.unwrap()).unwrap();
        assert_eq!(safety.reason, "pre-restore");
        assert_eq!(safety.snapshot_configuration, json!({"alias": "broken"}));
    }

    #[tokio::test]
    async fn test_restore_without_any_version() {
        let (versions, vault) = test_vault();
        let backup = vault.create("fresh", "home-1", json!({"alias": "x"}), "import").unwrap();

        let outcome = vault.restore(&backup.backup_id, "bob", "home-1").await.unwrap();

        assert_eq!(outcome.version.sequence_number, 1);
        assert!(outcome.safety_backup_id.is_none());
        assert_eq!(versions.latest("fresh", "home-1").unwrap(), outcome.version);
    }

    #[tokio::test]
    async fn test_restore_cross_connection_is_not_found() {
        let (versions, vault) = test_vault();
        let backup = vault.create("a1", "home-1", json!({}), "manual").unwrap();

        let err = vault.restore(&backup.backup_id, "mallory", "home-2").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(versions.version_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_push_leaves_ledger_untouched() {
        let versions = Arc::new(VersionStore::new());
        let authoring = Arc::new(RecordingAuthoring {
            pushes: AtomicUsize::new(0),
            fail: true,
        });
        let vault = BackupVault::new(versions.clone(), authoring.clone());
        seed_version(&versions, "a1", json!({"alias": "current"}));
        let backup = vault.create("a1", "home-1", json!({"alias": "old"}), "manual").unwrap();

        let err = vault.restore(&backup.backup_id, "bob", "home-1").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(authoring.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(versions.version_count(), 1);
        // Safety backup is kept as evidence
        assert_eq!(vault.list_for("a1").len(), 2);
    }

    #[tokio::test]
    async fn test_restore_fires_event() {
        let bus = Arc::new(EventBus::new());
        let versions = Arc::new(VersionStore::new());
        let vault = BackupVault::new(versions, Arc::new(NoopAuthoring)).with_event_bus(bus.clone());
        let mut rx = bus.listen::<BackupRestoredData>();
        let backup = vault.create("a1", "home-1", json!({}), "manual").unwrap();

        let outcome = vault.restore(&backup.backup_id, "bob", "home-1").await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.data.backup_id, backup.backup_id);
        assert_eq!(event.data.version_id, outcome.version.version_id);
    }

    #[test]
    fn test_delete() {
        let (_, vault) = test_vault();
        let backup = vault.create("a1", "home-1", json!({}), "manual").unwrap();

        assert_eq!(vault.delete(&backup.backup_id).unwrap(), backup);
        assert!(vault.list_for("a1").is_empty());
        assert_eq!(
            vault.delete(&backup.backup_id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_prune_per_automation_cap_is_idempotent() {
        let (_, vault) = test_vault();
        let a1: Vec<_> = (0..4)
            .map(|n| vault.create("a1", "home-1", json!({"n": n}), "manual").unwrap())
            .collect();
        vault.create("a2", "home-1", json!({}), "manual").unwrap();

        let removed = vault.prune_older_than(2);

        assert_eq!(removed, vec![a1[0].backup_id.clone(), a1[1].backup_id.clone()]);
        let kept: Vec<String> = vault.list_for("a1").into_iter().map(|b| b.backup_id).collect();
        assert_eq!(kept, vec![a1[3].backup_id.clone(), a1[2].backup_id.clone()]);
        assert_eq!(vault.list_for("a2").len(), 1);

        assert!(vault.prune_older_than(2).is_empty());
    }

    #[test]
    fn test_prune_by_age() {
        let (_, vault) = test_vault();
        vault.create("a1", "home-1", json!({}), "manual").unwrap();
        vault.create("a1", "home-1", json!({}), "manual").unwrap();

        assert!(vault.prune_by_age(chrono::Duration::days(1)).is_empty());
        assert!(vault
            .prune_by_age(chrono::Duration::days(i64::from(u32::MAX)))
            .is_empty());
        assert_eq!(vault.prune_by_age(chrono::Duration::seconds(-60)).len(), 2);
        assert!(vault.is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let (_, vault) = test_vault();
        let first = vault.create("a1", "home-1", json!({"n": 1}), "manual").unwrap();
        let second = vault.create("a1", "home-1", json!({"n": 2}), "manual").unwrap();
        vault.save(&storage).await.unwrap();

        let (_, restored) = test_vault();
        assert_eq!(restored.load(&storage).await.unwrap(), 2);
        let listed: Vec<String> = restored.list_for("a1").into_iter().map(|b| b.backup_id).collect();
        assert_eq!(listed, vec![second.backup_id, first.backup_id]);
    }
}
