//! Persistence seams consumed by the engine.
//!
//! The engine owns policy only; storage lives behind these traits so the
//! same dispatch loop runs against PostgreSQL in production and the
//! in-memory store in tests. Implementations return `anyhow::Result` as
//! plain transport; the engine converts control-flow-relevant failures
//! into record state transitions and logs the rest.
//!
//! # Implementer notes
//!
//! - All cross-process mutations are optimistic: guarded updates that
//!   return whether a row changed, never blocking locks.
//! - Record status transitions are fenced by the per-key lock: the update
//!   must verify the lock row still carries the caller's version and
//!   otherwise change nothing.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::coordinator::PartitionAssignment;
use crate::instance::{Instance, InstanceStatus};
use crate::lock::KeyLock;
use crate::record::{OutboxRecord, OutboxStatus};

/// Storage for outbox records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Distinct keys in `partition_no` holding at least one `NEW` record
    /// with `next_retry_at <= now`, ordered by the oldest such record's
    /// `(created_at, id)`, at most `limit` keys.
    async fn eligible_keys(
        &self,
        partition_no: i32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// All `NEW` records for `key` in FIFO order (`created_at`, then `id`).
    async fn pending_for_key(&self, key: &str) -> Result<Vec<OutboxRecord>>;

    /// Transition a `NEW` record to `COMPLETED`.
    ///
    /// Returns `false` without changing anything when the fence no longer
    /// holds (the lock row's version moved on) or the record already left
    /// `NEW`.
    async fn mark_completed(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        fence: &KeyLock,
    ) -> Result<bool>;

    /// Transition a `NEW` record to `FAILED`, recording the final failure.
    /// Fenced like [`mark_completed`](RecordStore::mark_completed).
    async fn mark_failed(
        &self,
        id: Uuid,
        failure_count: i32,
        failure_reason: &str,
        fence: &KeyLock,
    ) -> Result<bool>;

    /// Record a failed attempt and reschedule: bump `failure_count`, set
    /// `failure_reason` and `next_retry_at`, keep the record `NEW`.
    /// Fenced like [`mark_completed`](RecordStore::mark_completed).
    async fn mark_retried(
        &self,
        id: Uuid,
        failure_count: i32,
        failure_reason: &str,
        next_retry_at: DateTime<Utc>,
        fence: &KeyLock,
    ) -> Result<bool>;

    /// Administrative: delete every record in `status`.
    async fn delete_by_status(&self, status: OutboxStatus) -> Result<u64>;

    /// Administrative: delete records for `key` in `status`.
    async fn delete_by_key_and_status(&self, key: &str, status: OutboxStatus) -> Result<u64>;
}

/// Storage for per-key locks. At most one row per key.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert a new lock row. Returns `false` when a row for the key
    /// already exists.
    async fn insert(&self, lock: &KeyLock) -> Result<bool>;

    /// Read the current lock row for a key.
    async fn find(&self, key: &str) -> Result<Option<KeyLock>>;

    /// Replace the row for `lock.key` only if its stored version equals
    /// `expected_version`. Returns whether the swap happened.
    async fn compare_and_swap(&self, expected_version: i64, lock: &KeyLock) -> Result<bool>;

    /// Delete the row for a key, but only while it still carries
    /// `version`. A holder whose lease was overtaken deletes nothing.
    async fn delete(&self, key: &str, version: i64) -> Result<()>;
}

/// Storage for instance registrations.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert or replace this instance's row.
    async fn register(&self, instance: &Instance) -> Result<()>;

    /// Update `last_heartbeat`.
    async fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Set the lifecycle status.
    async fn set_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()>;

    /// Mark every `RUNNING` instance whose `last_heartbeat` is before
    /// `cutoff` as `STOPPED`. Idempotent; any instance may run it.
    /// Returns the number of rows changed.
    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Instances with `status = RUNNING` and `last_heartbeat >= cutoff`.
    async fn live(&self, cutoff: DateTime<Utc>) -> Result<Vec<Instance>>;
}

/// Storage for partition ownership.
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Number of partition rows present.
    async fn count(&self) -> Result<u32>;

    /// Create unowned rows for partitions `0..count`. Only called when the
    /// table is empty; re-running against existing rows is a no-op.
    async fn init(&self, count: u32, at: DateTime<Utc>) -> Result<()>;

    /// Every partition assignment row.
    async fn list(&self) -> Result<Vec<PartitionAssignment>>;

    /// Set the owner of `partition_no` to `new_owner`, bumping the version,
    /// only if the stored version equals `expected_version`. Returns
    /// whether the swap happened.
    async fn compare_and_swap_owner(
        &self,
        partition_no: i32,
        expected_version: i64,
        new_owner: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool>;
}
