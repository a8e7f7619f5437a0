//! The version ledger
//!
//! One ledger per automation, ordered by ascending sequence number. The
//! ledger records the connection of its first version; every later access
//! from another connection is reported as "not found".

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ha_core::events::VersionCreatedData;
use ha_core::{
    AutomationIdentity, AutomationVersion, Context, LifecycleError, LifecycleResult, NewVersion,
};
use ha_event_bus::EventBus;
use ha_storage::{Storable, Storage, StorageResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diff::{diff_configurations, VersionDiffResult};
use crate::locks::{ApplyGuard, ApplyLocks};
use crate::statistics::VersionStatistics;

/// Storage key for the version ledger snapshot
pub const STORAGE_KEY: &str = "automation_lifecycle.versions";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Persisted form of every ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionLedgerSnapshot {
    pub versions: Vec<AutomationVersion>,
}

impl Storable for VersionLedgerSnapshot {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// One page of history, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub entries: Vec<AutomationVersion>,
    pub total_entries: usize,
    /// 1-based page number
    pub page_number: usize,
    pub page_size: usize,
    /// No older entries exist beyond this page
    pub is_complete: bool,
}

struct Ledger {
    connection_id: String,
    /// Ascending by sequence number, never empty
    versions: Vec<Arc<AutomationVersion>>,
}

impl Ledger {
    fn latest(&self) -> Option<&Arc<AutomationVersion>> {
        self.versions.last()
    }

    fn last_sequence(&self) -> u64 {
        self.latest().map(|v| v.sequence_number).unwrap_or(0)
    }
}

/// Append-only store of automation versions
pub struct VersionStore {
    /// automation_id -> ledger
    ledgers: DashMap<String, Ledger>,
    /// version_id -> version
    by_id: DashMap<String, Arc<AutomationVersion>>,
    locks: ApplyLocks,
    event_bus: Option<Arc<EventBus>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            ledgers: DashMap::new(),
            by_id: DashMap::new(),
            locks: ApplyLocks::new(),
            event_bus: None,
        }
    }

    /// Publish `automation_version_created` for every append
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Append a version
    ///
    /// Succeeds only if the sequence number is exactly one past the current
    /// latest (or 1 for a new automation). On any failure the store is left
    /// unchanged. The ledger entry is published before the id index, so a
    /// reader never finds a version by id that history does not contain.
    pub fn append(&self, version: AutomationVersion) -> LifecycleResult<AutomationVersion> {
        let version = Arc::new(version);

        match self.ledgers.entry(version.automation_id.clone()) {
            Entry::Occupied(mut entry) => {
                let ledger = entry.get_mut();
                if ledger.connection_id != version.connection_id {
                    return Err(LifecycleError::cross_tenant(
                        "automation",
                        &version.automation_id,
                        &version.connection_id,
                    ));
                }
                let expected = ledger.last_sequence() + 1;
                if version.sequence_number != expected {
                    return Err(LifecycleError::SequenceConflict {
                        automation_id: version.automation_id.clone(),
                        expected,
                        attempted: version.sequence_number,
                    });
                }
                ledger.versions.push(version.clone());
            }
            Entry::Vacant(entry) => {
                if version.sequence_number != 1 {
                    return Err(LifecycleError::SequenceConflict {
                        automation_id: version.automation_id.clone(),
                        expected: 1,
                        attempted: version.sequence_number,
                    });
                }
                entry.insert(Ledger {
                    connection_id: version.connection_id.clone(),
                    versions: vec![version.clone()],
                });
            }
        }

        self.by_id
            .insert(version.version_id.clone(), version.clone());

        debug!(
            automation_id = %version.automation_id,
            version_id = %version.version_id,
            sequence = version.sequence_number,
            "Appended version"
        );

        if let Some(bus) = &self.event_bus {
            bus.publish(
                VersionCreatedData::from(version.as_ref()),
                Context::for_user(&version.author_name, &version.connection_id),
            );
        }

        Ok(version.as_ref().clone())
    }

    /// Append a draft at the next sequence number, retrying sequence conflicts
    ///
    /// Each retry recomputes the sequence number and builds a fresh version.
    /// The conflict surfaces once `retries` extra attempts are exhausted.
    pub fn append_next(
        &self,
        draft: &NewVersion,
        retries: u32,
    ) -> LifecycleResult<AutomationVersion> {
        let mut attempt = 0;
        loop {
            let sequence = self.next_sequence_number(&draft.identity.automation_id);
            match self.append(draft.build(sequence)) {
                Err(err) if err.is_sequence_conflict() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        automation = %draft.identity,
                        attempt,
                        "Sequence conflict on append, retrying"
                    );
                }
                result => return result,
            }
        }
    }

    /// Get a version by id
    pub fn get(&self, version_id: &str) -> LifecycleResult<AutomationVersion> {
        self.by_id
            .get(version_id)
            .map(|v| v.as_ref().clone())
            .ok_or_else(|| LifecycleError::not_found("version", version_id))
    }

    /// Get a version by id, visible only to its own connection
    pub fn get_scoped(
        &self,
        version_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<AutomationVersion> {
        let version = self.get(version_id)?;
        if version.connection_id != connection_id {
            return Err(LifecycleError::cross_tenant(
                "version",
                version_id,
                connection_id,
            ));
        }
        Ok(version)
    }

    fn with_ledger<R>(
        &self,
        automation_id: &str,
        connection_id: &str,
        f: impl FnOnce(&Ledger) -> R,
    ) -> LifecycleResult<R> {
        let ledger = self
            .ledgers
            .get(automation_id)
            .ok_or_else(|| LifecycleError::not_found("automation", automation_id))?;
        if ledger.connection_id != connection_id {
            return Err(LifecycleError::cross_tenant(
                "automation",
                automation_id,
                connection_id,
            ));
        }
        Ok(f(&ledger))
    }

    /// One page of history, newest first (pages are 1-based)
    pub fn history(
        &self,
        automation_id: &str,
        connection_id: &str,
        page_number: usize,
        page_size: usize,
    ) -> LifecycleResult<HistoryPage> {
        if page_number == 0 {
            return Err(LifecycleError::violation(
                "invalid_page_number",
                "page numbers start at 1",
            ));
        }
        if page_size == 0 {
            return Err(LifecycleError::violation(
                "invalid_page_size",
                "page size must be positive",
            ));
        }

        self.with_ledger(automation_id, connection_id, |ledger| {
            let total_entries = ledger.versions.len();
            let skip = (page_number - 1).saturating_mul(page_size);
            let entries: Vec<AutomationVersion> = ledger
                .versions
                .iter()
                .rev()
                .skip(skip)
                .take(page_size)
                .map(|v| v.as_ref().clone())
                .collect();
            let is_complete = skip.saturating_add(entries.len()) >= total_entries;
            HistoryPage {
                entries,
                total_entries,
                page_number,
                page_size,
                is_complete,
            }
        })
    }

    /// Every retained version, newest first
    pub fn versions(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<Vec<AutomationVersion>> {
        self.with_ledger(automation_id, connection_id, |ledger| {
            ledger
                .versions
                .iter()
                .rev()
                .map(|v| v.as_ref().clone())
                .collect()
        })
    }

    /// The current version of an automation
    pub fn latest(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<AutomationVersion> {
        self.with_ledger(automation_id, connection_id, |ledger| {
            ledger.latest().map(|v| v.as_ref().clone())
        })?
        .ok_or_else(|| LifecycleError::not_found("automation", automation_id))
    }

    /// Connection that owns an automation, if it has any versions
    pub fn connection_of(&self, automation_id: &str) -> Option<String> {
        self.ledgers
            .get(automation_id)
            .map(|ledger| ledger.connection_id.clone())
    }

    /// Sequence number the next append must carry
    pub fn next_sequence_number(&self, automation_id: &str) -> u64 {
        self.ledgers
            .get(automation_id)
            .map(|ledger| ledger.last_sequence() + 1)
            .unwrap_or(1)
    }

    /// Structural comparison of two versions
    pub fn diff(&self, version_id_1: &str, version_id_2: &str) -> LifecycleResult<VersionDiffResult> {
        let source = self.get(version_id_1)?;
        let target = self.get(version_id_2)?;
        Ok(compare(&source, &target))
    }

    /// Structural comparison restricted to one connection
    pub fn diff_scoped(
        &self,
        version_id_1: &str,
        version_id_2: &str,
        connection_id: &str,
    ) -> LifecycleResult<VersionDiffResult> {
        let source = self.get_scoped(version_id_1, connection_id)?;
        let target = self.get_scoped(version_id_2, connection_id)?;
        Ok(compare(&source, &target))
    }

    pub fn statistics(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<VersionStatistics> {
        self.with_ledger(automation_id, connection_id, |ledger| {
            VersionStatistics::compute(ledger.versions.iter().map(|v| v.as_ref()))
        })?
        .ok_or_else(|| LifecycleError::not_found("automation", automation_id))
    }

    /// Evict the oldest versions beyond `max_versions_to_keep`
    ///
    /// The most recent version is never deleted, so a cap of 0 behaves like 1.
    /// Returns the ids of the removed versions; an automation already within
    /// its cap is left untouched.
    pub fn prune_older_than(&self, automation_id: &str, max_versions_to_keep: usize) -> Vec<String> {
        let keep = max_versions_to_keep.max(1);
        let removed: Vec<Arc<AutomationVersion>> = match self.ledgers.get_mut(automation_id) {
            Some(mut ledger) => {
                let excess = ledger.versions.len().saturating_sub(keep);
                ledger.versions.drain(..excess).collect()
            }
            None => Vec::new(),
        };
        self.forget(automation_id, removed, "count cap")
    }

    /// Evict versions older than `max_age`, never the most recent one
    pub fn prune_by_age(&self, automation_id: &str, max_age: chrono::Duration) -> Vec<String> {
        // An age reaching past the earliest representable instant prunes nothing
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return Vec::new();
        };
        let removed: Vec<Arc<AutomationVersion>> = match self.ledgers.get_mut(automation_id) {
            Some(mut ledger) => {
                let evictable = ledger.versions.len().saturating_sub(1);
                let expired = ledger.versions[..evictable]
                    .iter()
                    .take_while(|v| v.created_at < cutoff)
                    .count();
                ledger.versions.drain(..expired).collect()
            }
            None => Vec::new(),
        };
        self.forget(automation_id, removed, "age limit")
    }

    fn forget(
        &self,
        automation_id: &str,
        removed: Vec<Arc<AutomationVersion>>,
        policy: &str,
    ) -> Vec<String> {
        let ids: Vec<String> = removed.iter().map(|v| v.version_id.clone()).collect();
        for id in &ids {
            self.by_id.remove(id);
        }
        if !ids.is_empty() {
            info!(
                automation_id,
                removed = ids.len(),
                policy,
                "Pruned automation versions"
            );
        }
        ids
    }

    /// Wait for exclusive apply access to an automation
    pub async fn apply_lock(&self, identity: &AutomationIdentity) -> ApplyGuard {
        self.locks.acquire(identity).await
    }

    /// Check whether an apply is running for an automation
    pub fn is_applying(&self, identity: &AutomationIdentity) -> bool {
        self.locks.is_held(identity)
    }

    /// Number of applies currently running
    pub fn applying_count(&self) -> usize {
        self.locks.held_count()
    }

    /// Forget apply locks of automations nobody is applying to
    pub fn release_idle_locks(&self) -> usize {
        self.locks.prune_idle()
    }

    pub fn automation_ids(&self) -> Vec<String> {
        self.ledgers.iter().map(|r| r.key().clone()).collect()
    }

    pub fn automation_count(&self) -> usize {
        self.ledgers.len()
    }

    pub fn version_count(&self) -> usize {
        self.by_id.len()
    }

    /// Number of automations whose latest version is a tombstone
    pub fn retired_count(&self) -> usize {
        self.ledgers
            .iter()
            .filter(|r| r.latest().map(|v| v.tombstone).unwrap_or(false))
            .count()
    }

    /// Copy of every ledger, grouped by automation in sequence order
    pub fn export_snapshot(&self) -> VersionLedgerSnapshot {
        let mut versions: Vec<AutomationVersion> = self
            .ledgers
            .iter()
            .flat_map(|r| {
                r.versions
                    .iter()
                    .map(|v| v.as_ref().clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        versions.sort_by(|a, b| {
            a.automation_id
                .cmp(&b.automation_id)
                .then(a.sequence_number.cmp(&b.sequence_number))
        });
        VersionLedgerSnapshot { versions }
    }

    /// Merge a snapshot into the store
    ///
    /// Pruned ledgers do not start at sequence 1, so imports only require
    /// strictly increasing sequence numbers per automation. Versions that
    /// would break that, or cross a connection, are skipped.
    pub fn import_snapshot(&self, snapshot: VersionLedgerSnapshot) -> usize {
        let mut versions = snapshot.versions;
        versions.sort_by(|a, b| {
            a.automation_id
                .cmp(&b.automation_id)
                .then(a.sequence_number.cmp(&b.sequence_number))
        });

        let mut imported = 0;
        for version in versions {
            let version = Arc::new(version);
            let accepted = match self.ledgers.entry(version.automation_id.clone()) {
                Entry::Occupied(mut entry) => {
                    let ledger = entry.get_mut();
                    if ledger.connection_id == version.connection_id
                        && version.sequence_number > ledger.last_sequence()
                    {
                        ledger.versions.push(version.clone());
                        true
                    } else {
                        false
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Ledger {
                        connection_id: version.connection_id.clone(),
                        versions: vec![version.clone()],
                    });
                    true
                }
            };

            if accepted {
                self.by_id
                    .insert(version.version_id.clone(), version);
                imported += 1;
            } else {
                warn!(
                    automation_id = %version.automation_id,
                    version_id = %version.version_id,
                    sequence = version.sequence_number,
                    "Skipping out-of-order version in snapshot"
                );
            }
        }
        imported
    }

    /// Persist every ledger to `.storage/`
    pub async fn save(&self, storage: &Storage) -> StorageResult<()> {
        storage.save(&self.export_snapshot()).await?;
        debug!("Saved {} versions to storage", self.version_count());
        Ok(())
    }

    /// Load ledgers from `.storage/`, returning the number of versions loaded
    pub async fn load(&self, storage: &Storage) -> StorageResult<usize> {
        let Some(snapshot) = storage.load::<VersionLedgerSnapshot>().await? else {
            return Ok(0);
        };
        let imported = self.import_snapshot(snapshot);
        info!("Loaded {} automation versions from storage", imported);
        Ok(imported)
    }
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compare(source: &AutomationVersion, target: &AutomationVersion) -> VersionDiffResult {
    VersionDiffResult::new(
        &source.version_id,
        &target.version_id,
        diff_configurations(&source.configuration, &target.configuration),
    )
}
