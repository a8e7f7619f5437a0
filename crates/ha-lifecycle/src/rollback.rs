//! Rollback target resolution

use std::sync::Arc;

use ha_core::{AutomationVersion, LifecycleError, LifecycleResult};
use ha_versioning::VersionStore;

/// Decides which versions an automation may be rolled back to
#[derive(Clone)]
pub struct RollbackPlanner {
    versions: Arc<VersionStore>,
}

impl RollbackPlanner {
    pub fn new(versions: Arc<VersionStore>) -> Self {
        Self { versions }
    }

    /// Every version except the current one, newest first
    ///
    /// Tombstones are never offered as targets.
    pub fn targets(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<Vec<AutomationVersion>> {
        Ok(self
            .versions
            .versions(automation_id, connection_id)?
            .into_iter()
            .skip(1)
            .filter(|v| !v.tombstone)
            .collect())
    }

    /// The most recent version before the current one
    pub fn previous_target(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<AutomationVersion> {
        self.targets(automation_id, connection_id)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                LifecycleError::violation(
                    "no_rollback_target",
                    format!("automation {} has no earlier version", automation_id),
                )
            })
    }

    /// Check that `target_version_id` is a legal rollback target
    ///
    /// A target from another automation or connection is reported as not
    /// found. Rolling back to the current version is rejected rather than
    /// treated as a no-op.
    pub fn validate(
        &self,
        automation_id: &str,
        target_version_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<AutomationVersion> {
        let target = self.versions.get_scoped(target_version_id, connection_id)?;
        if target.automation_id != automation_id {
            return Err(LifecycleError::not_found("version", target_version_id));
        }

        let latest = self.versions.latest(automation_id, connection_id)?;
        if target.version_id == latest.version_id {
            return Err(LifecycleError::violation(
                "rollback_to_current",
                format!("version {} is already current", target_version_id),
            ));
        }
        if target.tombstone {
            return Err(LifecycleError::violation(
                "rollback_to_tombstone",
                format!("version {} is a retirement marker", target_version_id),
            ));
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ha_core::{AutomationIdentity, ErrorKind, NewVersion};
    use serde_json::json;

    fn seed(
        store: &VersionStore,
        automation_id: &str,
        connection_id: &str,
        n: u32,
    ) -> Vec<String> {
        (1..=n)
            .map(|i| {
                store
                    .append_next(
                        &NewVersion::new(
                            AutomationIdentity::new(automation_id, connection_id),
                            json!({"alias": format!("v{i}")}),
                            "alice",
                            format!("edit {i}"),
                        ),
                        0,
                    )
                    .unwrap()
                    .version_id
            })
            .collect()
    }

    #[test]
    fn test_targets_exclude_latest() {
        let store = Arc::new(VersionStore::new());
        let ids = seed(&store, "x", "home-1", 3);
        let planner = RollbackPlanner::new(store);

        let targets: Vec<String> = planner
            .targets("x", "home-1")
            .unwrap()
            .into_iter()
            .map(|v| v.version_id)
            .collect();
        assert_eq!(targets, vec![ids[1].clone(), ids[0].clone()]);
        assert_eq!(planner.previous_target("x", "home-1").unwrap().version_id, ids[1]);
    }

    #[test]
    fn test_validate_rejects_current() {
        let store = Arc::new(VersionStore::new());
        let ids = seed(&store, "x", "home-1", 2);
        let planner = RollbackPlanner::new(store);

        let err = planner.validate("x", &ids[1], "home-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailure);
        assert_eq!(err.violations()[0].rule, "rollback_to_current");

        assert_eq!(planner.validate("x", &ids[0], "home-1").unwrap().version_id, ids[0]);
    }

    #[test]
    fn test_validate_rejects_cross_connection_and_foreign_targets() {
        let store = Arc::new(VersionStore::new());
        let ids = seed(&store, "x", "home-1", 2);
        let other = seed(&store, "y", "home-1", 2);
        let planner = RollbackPlanner::new(store);

        let err = planner.validate("x", &ids[0], "home-2").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = planner.validate("x", &other[0], "home-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = planner.validate("x", "missing", "home-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_tombstones_are_not_targets() {
        let store = Arc::new(VersionStore::new());
        let ids = seed(&store, "x", "home-1", 1);
        let tombstone = store
            .append_next(
                &NewVersion::new(
                    AutomationIdentity::new("x", "home-1"),
                    json!({}),
                    "alice",
                    "retired",
                )
                .as_tombstone(),
                0,
            )
            .unwrap();
        seed(&store, "x", "home-1", 1);
        let planner = RollbackPlanner::new(store);

        let err = planner
            .validate("x", &tombstone.version_id, "home-1")
            .unwrap_err();
        assert_eq!(err.violations()[0].rule, "rollback_to_tombstone");
        assert_eq!(planner.previous_target("x", "home-1").unwrap().version_id, ids[0]);
    }

    #[test]
    fn test_no_previous_target() {
        let store = Arc::new(VersionStore::new());
        seed(&store, "x", "home-1", 1);
        let planner = RollbackPlanner::new(store);

        let err = planner.previous_target("x", "home-1").unwrap_err();
        assert_eq!(err.violations()[0].rule, "no_rollback_target");
    }
}
