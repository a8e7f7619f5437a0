//! Per-automation apply locks
//!
//! Only the apply phase (backup + append) is serialised. Validation and
//! pending sessions never hold a lock, so a long-lived pending session cannot
//! starve other callers.

use std::sync::Arc;

use dashmap::DashMap;
use ha_core::AutomationIdentity;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Guard held for the duration of one apply
pub type ApplyGuard = OwnedMutexGuard<()>;

/// Lazily created mutex per `(automation_id, connection_id)`
#[derive(Default)]
pub struct ApplyLocks {
    locks: DashMap<AutomationIdentity, Arc<Mutex<()>>>,
}

impl ApplyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive apply access to an automation
    pub async fn acquire(&self, identity: &AutomationIdentity) -> ApplyGuard {
        // Clone the Arc out so the DashMap shard is not held across the await
        let lock = self
            .locks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        trace!(automation = %identity, "Waiting for apply lock");
        lock.lock_owned().await
    }

    /// Check whether an apply is currently running for an automation
    pub fn is_held(&self, identity: &AutomationIdentity) -> bool {
        self.locks
            .get(identity)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop the mutexes nobody holds or waits on
    ///
    /// `acquire` clones the Arc under the shard guard, so an entry with a
    /// strong count of one has no holder and no waiter.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let released = before.saturating_sub(self.locks.len());
        if released > 0 {
            trace!(released, "Released idle apply locks");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Number of applies currently running
    pub fn held_count(&self) -> usize {
        self.locks
            .iter()
            .filter(|entry| entry.value().try_lock().is_err())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_per_automation() {
        let locks = ApplyLocks::new();
        let a = AutomationIdentity::new("a", "home-1");
        let b = AutomationIdentity::new("b", "home-1");

        let _guard_a = locks.acquire(&a).await;
        assert!(locks.is_held(&a));
        assert!(!locks.is_held(&b));

        // A different automation is not blocked
        let guard_b = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&b)).await;
        assert!(guard_b.is_ok());
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let locks = Arc::new(ApplyLocks::new());
        let a = AutomationIdentity::new("a", "home-1");

        let guard = locks.acquire(&a).await;
        let blocked = tokio::time::timeout(Duration::from_millis(20), locks.acquire(&a)).await;
        assert!(blocked.is_err());

        drop(guard);
        let _guard = locks.acquire(&a).await;
        assert_eq!(locks.held_count(), 1);
    }

    #[tokio::test]
    async fn test_prune_idle_keeps_held_locks() {
        let locks = ApplyLocks::new();
        let a = AutomationIdentity::new("a", "home-1");
        let b = AutomationIdentity::new("b", "home-1");

        let guard_a = locks.acquire(&a).await;
        drop(locks.acquire(&b).await);
        assert_eq!(locks.len(), 2);

        assert_eq!(locks.prune_idle(), 1);
        assert!(locks.is_held(&a));
        assert_eq!(locks.len(), 1);

        drop(guard_a);
        assert_eq!(locks.prune_idle(), 1);
        assert!(locks.is_empty());

        // Recreated on demand
        let _guard = locks.acquire(&a).await;
        assert!(locks.is_held(&a));
    }
}
