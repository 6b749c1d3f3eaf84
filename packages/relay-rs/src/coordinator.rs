//! Leased-partition coordination across instances.
//!
//! Partitions are the unit of ownership: each one is claimed by at most
//! one live instance, and the dispatch loop only touches partitions in
//! the owned set it reads at the start of a tick (fencing). Ownership
//! moves exclusively through compare-and-swap on the assignment row's
//! version column, so no external coordination service is involved;
//! a lost race simply retries on the next rebalance.
//!
//! Target ownership is round-robin: partition `n` belongs to the
//! `n % live_count`-th entry of the sorted live-instance ids. An
//! instance claims a partition only when it is the target and the
//! current owner is absent or dead, and it releases partitions it owns
//! but no longer targets, which converges per-instance counts to within
//! one of each other without ever preempting a live owner.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{to_delta, Clock, SharedClock};
use crate::store::{InstanceStore, PartitionStore};

/// Ownership row for one partition.
#[derive(Debug, Clone)]
pub struct PartitionAssignment {
    pub partition_no: i32,
    /// Current owner; `None` when unclaimed or released.
    pub instance_id: Option<String>,
    /// Monotonically increasing; the CAS guard for ownership transfer.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Claims and releases partition leases for one instance.
pub struct PartitionCoordinator {
    partitions: Arc<dyn PartitionStore>,
    instances: Arc<dyn InstanceStore>,
    clock: SharedClock,
    instance_id: String,
    heartbeat_timeout: Duration,
    rebalance_interval: Duration,
    owned: RwLock<BTreeSet<i32>>,
}

impl PartitionCoordinator {
    pub fn new(
        partitions: Arc<dyn PartitionStore>,
        instances: Arc<dyn InstanceStore>,
        clock: SharedClock,
        instance_id: String,
        heartbeat_timeout: Duration,
        rebalance_interval: Duration,
    ) -> Self {
        Self {
            partitions,
            instances,
            clock,
            instance_id,
            heartbeat_timeout,
            rebalance_interval,
            owned: RwLock::new(BTreeSet::new()),
        }
    }

    /// Snapshot of the partitions this instance currently owns.
    ///
    /// The dispatch loop reads this once at the start of every tick and
    /// never processes a partition outside it.
    pub fn owned_partitions(&self) -> Vec<i32> {
        self.owned.read().expect("owned set poisoned").iter().copied().collect()
    }

    /// One rebalance pass: recompute targets from the live-instance set
    /// and claim or hand off partitions accordingly.
    pub async fn rebalance(&self) -> Result<()> {
        let now = self.clock.now();
        let cutoff = now - to_delta(self.heartbeat_timeout);

        let mut live: Vec<String> = self
            .instances
            .live(cutoff)
            .await?
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        live.sort();

        if !live.iter().any(|id| id == &self.instance_id) {
            // Our own heartbeat is not visible yet (or has gone stale);
            // owning anything now would race the instance that sweeps us.
            *self.owned.write().expect("owned set poisoned") = BTreeSet::new();
            return Ok(());
        }

        let assignments = self.partitions.list().await?;
        let mut owned = BTreeSet::new();

        for assignment in assignments {
            let target = &live[assignment.partition_no as usize % live.len()];
            let owner = assignment.instance_id.as_deref();
            let owner_is_live = owner.map(|id| live.iter().any(|l| l == id)).unwrap_or(false);

            if owner == Some(self.instance_id.as_str()) {
                if *target == self.instance_id {
                    owned.insert(assignment.partition_no);
                } else {
                    // The ring moved; hand the partition to its new target.
                    let released = self
                        .partitions
                        .compare_and_swap_owner(
                            assignment.partition_no,
                            assignment.version,
                            None,
                            now,
                        )
                        .await?;
                    if released {
                        debug!(
                            partition = assignment.partition_no,
                            target = %target,
                            "released partition for rebalance"
                        );
                    }
                }
                continue;
            }

            if *target == self.instance_id && !owner_is_live {
                let claimed = self
                    .partitions
                    .compare_and_swap_owner(
                        assignment.partition_no,
                        assignment.version,
                        Some(&self.instance_id),
                        now,
                    )
                    .await?;
                if claimed {
                    debug!(
                        partition = assignment.partition_no,
                        previous_owner = ?owner,
                        "claimed partition"
                    );
                    owned.insert(assignment.partition_no);
                }
                // A lost CAS means another pass raced us; retry next tick.
            }
        }

        *self.owned.write().expect("owned set poisoned") = owned;
        Ok(())
    }

    /// CAS-release every partition this instance owns. Used on graceful
    /// shutdown so peers can claim immediately instead of waiting for the
    /// heartbeat timeout.
    pub async fn release_all(&self) -> Result<()> {
        let owned: BTreeSet<i32> =
            std::mem::take(&mut *self.owned.write().expect("owned set poisoned"));
        if owned.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        for assignment in self.partitions.list().await? {
            if !owned.contains(&assignment.partition_no) {
                continue;
            }
            if assignment.instance_id.as_deref() != Some(self.instance_id.as_str()) {
                continue;
            }
            let released = self
                .partitions
                .compare_and_swap_owner(assignment.partition_no, assignment.version, None, now)
                .await?;
            if !released {
                warn!(
                    partition = assignment.partition_no,
                    "partition release lost a race; leaving it to the new owner"
                );
            }
        }
        debug!(count = owned.len(), "released owned partitions");
        Ok(())
    }

    /// Rebalance loop; runs until the token is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.rebalance_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.rebalance().await {
                        warn!(instance_id = %self.instance_id, error = %e, "rebalance failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::config::InstanceConfig;
    use crate::instance::InstanceRegistrar;
    use crate::testing::{ManualClock, MemoryStore};

    const TIMEOUT: Duration = Duration::from_secs(15);

    fn instance_config() -> InstanceConfig {
        InstanceConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: TIMEOUT,
            hostname: None,
            port: 0,
        }
    }

    async fn registered_instance(
        store: &Arc<MemoryStore>,
        clock: &Arc<ManualClock>,
    ) -> InstanceRegistrar {
        let registrar = InstanceRegistrar::new(store.clone(), clock.clone(), &instance_config());
        registrar.register().await.unwrap();
        registrar
    }

    fn coordinator(
        store: &Arc<MemoryStore>,
        clock: &Arc<ManualClock>,
        instance_id: &str,
    ) -> PartitionCoordinator {
        PartitionCoordinator::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            instance_id.to_owned(),
            TIMEOUT,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_single_instance_claims_every_partition() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        store.init(4, clock.now()).await.unwrap();
        let me = registered_instance(&store, &clock).await;

        let coord = coordinator(&store, &clock, me.instance_id());
        coord.rebalance().await.unwrap();

        assert_eq!(coord.owned_partitions(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_two_instances_balance_within_one() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        store.init(5, clock.now()).await.unwrap();
        let a = registered_instance(&store, &clock).await;
        let b = registered_instance(&store, &clock).await;

        let coord_a = coordinator(&store, &clock, a.instance_id());
        let coord_b = coordinator(&store, &clock, b.instance_id());
        coord_a.rebalance().await.unwrap();
        coord_b.rebalance().await.unwrap();

        let owned_a = coord_a.owned_partitions();
        let owned_b = coord_b.owned_partitions();
        assert_eq!(owned_a.len() + owned_b.len(), 5);
        assert!(owned_a.iter().all(|p| !owned_b.contains(p)));
        assert!((owned_a.len() as i64 - owned_b.len() as i64).abs() <= 1);
    }

    #[tokio::test]
    async fn test_dead_owner_is_taken_over() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        store.init(4, clock.now()).await.unwrap();
        let dead = registered_instance(&store, &clock).await;

        let coord_dead = coordinator(&store, &clock, dead.instance_id());
        coord_dead.rebalance().await.unwrap();
        assert_eq!(coord_dead.owned_partitions().len(), 4);

        // The dead instance stops heartbeating; a survivor registers and
        // sweeps it, then takes every partition.
        clock.advance(Duration::from_secs(60));
        let survivor = registered_instance(&store, &clock).await;
        survivor.tick().await.unwrap();

        let coord_survivor = coordinator(&store, &clock, survivor.instance_id());
        coord_survivor.rebalance().await.unwrap();
        assert_eq!(coord_survivor.owned_partitions().len(), 4);
    }

    #[tokio::test]
    async fn test_joining_instance_receives_handoff() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        store.init(4, clock.now()).await.unwrap();
        let a = registered_instance(&store, &clock).await;

        let coord_a = coordinator(&store, &clock, a.instance_id());
        coord_a.rebalance().await.unwrap();
        assert_eq!(coord_a.owned_partitions().len(), 4);

        let b = registered_instance(&store, &clock).await;
        let coord_b = coordinator(&store, &clock, b.instance_id());

        // A releases what it no longer targets, then B claims it.
        coord_a.rebalance().await.unwrap();
        coord_b.rebalance().await.unwrap();

        let total = coord_a.owned_partitions().len() + coord_b.owned_partitions().len();
        assert_eq!(total, 4);
        assert!(!coord_b.owned_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_release_all_clears_ownership() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        store.init(3, clock.now()).await.unwrap();
        let me = registered_instance(&store, &clock).await;

        let coord = coordinator(&store, &clock, me.instance_id());
        coord.rebalance().await.unwrap();
        coord.release_all().await.unwrap();

        assert!(coord.owned_partitions().is_empty());
        let assignments = store.list().await.unwrap();
        assert!(assignments.iter().all(|a| a.instance_id.is_none()));
    }

    #[tokio::test]
    async fn test_live_owner_is_never_preempted() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::epoch());
        store.init(1, clock.now()).await.unwrap();
        let a = registered_instance(&store, &clock).await;
        let b = registered_instance(&store, &clock).await;

        let coord_a = coordinator(&store, &clock, a.instance_id());
        let coord_b = coordinator(&store, &clock, b.instance_id());

        // Whichever instance is the ring target claims partition 0; the
        // other must not steal it while the owner stays live.
        coord_a.rebalance().await.unwrap();
        coord_b.rebalance().await.unwrap();
        let first_owner: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|p| p.instance_id)
            .collect();
        assert_eq!(first_owner.len(), 1);

        coord_a.rebalance().await.unwrap();
        coord_b.rebalance().await.unwrap();
        let second_owner: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|p| p.instance_id)
            .collect();
        assert_eq!(first_owner, second_owner);
    }
}
