//! Per-key mutual exclusion leases.
//!
//! A lock row guarantees at most one concurrent handler invocation per key
//! across the whole cluster. Rows mutate only through compare-and-swap on
//! their version column; every operation fails closed, so a `None` from
//! acquire or renew means "another worker holds it" and the caller skips
//! the key for the tick.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::{to_delta, Clock, SharedClock};
use crate::config::LockingConfig;
use crate::store::LockStore;

/// A per-key lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLock {
    /// The guarded key.
    pub key: String,
    /// When the current holder first took the lease.
    pub acquired_at: DateTime<Utc>,
    /// The lease is reclaimable once `now > expires_at`.
    pub expires_at: DateTime<Utc>,
    /// Bumped on every mutation; the fence token for record updates.
    pub version: i64,
}

/// Acquires, renews, overtakes, and releases per-key leases.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    clock: SharedClock,
    extension: Duration,
    refresh_threshold: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, clock: SharedClock, config: &LockingConfig) -> Self {
        Self {
            store,
            clock,
            extension: config.extension,
            refresh_threshold: config.refresh_threshold,
        }
    }

    /// Try to take the lease for `key`.
    ///
    /// Inserts a fresh row; if one already exists, falls through to an
    /// overtake attempt against an expired lease.
    pub async fn acquire(&self, key: &str) -> Result<Option<KeyLock>> {
        let now = self.clock.now();
        let candidate = KeyLock {
            key: key.to_owned(),
            acquired_at: now,
            expires_at: now + to_delta(self.extension),
            version: 0,
        };
        if self.store.insert(&candidate).await? {
            return Ok(Some(candidate));
        }
        self.overtake(key, now).await
    }

    /// Reclaim an expired lease via CAS. Returns `None` while the current
    /// holder's lease is still valid or when another worker races us.
    async fn overtake(&self, key: &str, now: DateTime<Utc>) -> Result<Option<KeyLock>> {
        let Some(existing) = self.store.find(key).await? else {
            // Row vanished between insert and read; treat as contended.
            return Ok(None);
        };
        if now <= existing.expires_at {
            return Ok(None);
        }
        let taken = KeyLock {
            key: key.to_owned(),
            acquired_at: now,
            expires_at: now + to_delta(self.extension),
            version: existing.version + 1,
        };
        if self.store.compare_and_swap(existing.version, &taken).await? {
            debug!(key = %key, version = taken.version, "overtook expired key lease");
            Ok(Some(taken))
        } else {
            Ok(None)
        }
    }

    /// Extend a held lease when it approaches expiry.
    ///
    /// Leases with more than `refresh_threshold` left are returned
    /// unchanged. A `None` means the lease was lost to an overtake; the
    /// caller must stop working on the key.
    pub async fn renew(&self, lock: &KeyLock) -> Result<Option<KeyLock>> {
        let now = self.clock.now();
        if lock.expires_at - now > to_delta(self.refresh_threshold) {
            return Ok(Some(lock.clone()));
        }
        let extended = KeyLock {
            key: lock.key.clone(),
            acquired_at: lock.acquired_at,
            expires_at: now + to_delta(self.extension),
            version: lock.version + 1,
        };
        if self.store.compare_and_swap(lock.version, &extended).await? {
            Ok(Some(extended))
        } else {
            Ok(None)
        }
    }

    /// Drop the lease. Guarded by the lease's version, so releasing after
    /// an overtake cannot delete the new holder's row.
    pub async fn release(&self, lock: &KeyLock) -> Result<()> {
        self.store.delete(&lock.key, lock.version).await
    }

    /// Renew when less than this much lease time remains; also the cadence
    /// at which an in-flight invocation checks its lease.
    pub(crate) fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, MemoryStore};

    fn manager(
        store: &Arc<MemoryStore>,
        clock: &Arc<ManualClock>,
        extension_ms: u64,
        refresh_ms: u64,
    ) -> LockManager {
        LockManager::new(
            store.clone(),
            clock.clone(),
            &LockingConfig {
                extension: Duration::from_millis(extension_ms),
                refresh_threshold: Duration::from_millis(refresh_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_fresh_key() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let locks = manager(&store, &clock, 10_000, 3_000);

        let lock = locks.acquire("a").await.unwrap().unwrap();
        assert_eq!(lock.key, "a");
        assert_eq!(lock.version, 0);
        assert_eq!(lock.expires_at - lock.acquired_at, chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn test_acquire_contended_key_fails_closed() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let locks = manager(&store, &clock, 10_000, 3_000);
        let other = manager(&store, &clock, 10_000, 3_000);

        assert!(locks.acquire("a").await.unwrap().is_some());
        assert!(other.acquire("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overtake_after_expiry() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let locks = manager(&store, &clock, 10_000, 3_000);

        let original = locks.acquire("a").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(11));

        let taken = locks.acquire("a").await.unwrap().unwrap();
        assert_eq!(taken.version, original.version + 1);
        assert!(taken.expires_at > original.expires_at);
    }

    #[tokio::test]
    async fn test_renew_far_from_expiry_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let locks = manager(&store, &clock, 10_000, 3_000);

        let lock = locks.acquire("a").await.unwrap().unwrap();
        let renewed = locks.renew(&lock).await.unwrap().unwrap();
        assert_eq!(renewed, lock);
    }

    #[tokio::test]
    async fn test_renew_near_expiry_extends_and_bumps_version() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let locks = manager(&store, &clock, 10_000, 3_000);

        let lock = locks.acquire("a").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(8));

        let renewed = locks.renew(&lock).await.unwrap().unwrap();
        assert_eq!(renewed.version, lock.version + 1);
        assert!(renewed.expires_at > lock.expires_at);
    }

    #[tokio::test]
    async fn test_renew_after_overtake_reports_lost_lease() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let locks = manager(&store, &clock, 10_000, 3_000);
        let thief = manager(&store, &clock, 10_000, 3_000);

        let lock = locks.acquire("a").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(11));
        assert!(thief.acquire("a").await.unwrap().is_some());

        assert!(locks.renew(&lock).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_frees_the_key() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let locks = manager(&store, &clock, 10_000, 3_000);

        let lock = locks.acquire("a").await.unwrap().unwrap();
        locks.release(&lock).await.unwrap();
        let again = locks.acquire("a").await.unwrap().unwrap();
        assert_eq!(again.version, 0);
    }

    #[tokio::test]
    async fn test_stale_release_leaves_the_new_holder_alone() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        let locks = manager(&store, &clock, 10_000, 3_000);
        let thief = manager(&store, &clock, 10_000, 3_000);

        let stale = locks.acquire("a").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(11));
        let current = thief.acquire("a").await.unwrap().unwrap();

        locks.release(&stale).await.unwrap();
        let row = LockStore::find(store.as_ref(), "a").await.unwrap().unwrap();
        assert_eq!(row.version, current.version);
    }
}
