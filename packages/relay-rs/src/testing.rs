//! Testing utilities: in-memory stores, a manual clock, and scripted
//! handlers.
//!
//! Available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! relay = { version = "0.1", features = ["testing"] }
//! ```
//!
//! [`MemoryStore`] implements all four store traits over shared tables so
//! a full engine can run against it; because the record and lock tables
//! live together, fenced record updates verify the lock version exactly
//! like the SQL implementation does. [`ManualClock`] makes retry timing
//! and lease expiry deterministic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::coordinator::PartitionAssignment;
use crate::handler::{Delivery, FailureInfo, Fallback, Handler, HandlerError};
use crate::instance::{Instance, InstanceStatus};
use crate::lock::KeyLock;
use crate::record::{OutboxRecord, OutboxStatus};
use crate::store::{InstanceStore, LockStore, PartitionStore, RecordStore};

// =============================================================================
// ManualClock
// =============================================================================

/// Clock under test control.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at 2024-01-01T00:00:00Z.
    pub fn epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += crate::clock::to_delta(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<Uuid, OutboxRecord>>,
    locks: Mutex<HashMap<String, KeyLock>>,
    instances: Mutex<HashMap<String, Instance>>,
    partitions: Mutex<HashMap<i32, PartitionAssignment>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a composed record, as a storage adapter would inside the
    /// producer's transaction.
    pub fn insert_record(&self, record: OutboxRecord) {
        self.records.lock().unwrap().insert(record.id, record);
    }

    /// Fetch a record by id.
    pub fn record(&self, id: Uuid) -> Option<OutboxRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    /// Every record, unordered.
    pub fn all_records(&self) -> Vec<OutboxRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    fn fence_holds(&self, fence: &KeyLock) -> bool {
        self.locks
            .lock()
            .unwrap()
            .get(&fence.key)
            .map(|held| held.version == fence.version)
            .unwrap_or(false)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn eligible_keys(
        &self,
        partition_no: i32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let records = self.records.lock().unwrap();
        let mut oldest: HashMap<&str, (DateTime<Utc>, Uuid)> = HashMap::new();
        for record in records.values() {
            if record.partition_no != partition_no
                || record.status != OutboxStatus::New
                || record.next_retry_at > now
            {
                continue;
            }
            let entry = oldest
                .entry(record.key.as_str())
                .or_insert((record.created_at, record.id));
            if (record.created_at, record.id) < *entry {
                *entry = (record.created_at, record.id);
            }
        }
        let mut keys: Vec<(DateTime<Utc>, Uuid, String)> = oldest
            .into_iter()
            .map(|(key, (created_at, id))| (created_at, id, key.to_owned()))
            .collect();
        keys.sort();
        Ok(keys.into_iter().take(limit).map(|(_, _, key)| key).collect())
    }

    async fn pending_for_key(&self, key: &str) -> Result<Vec<OutboxRecord>> {
        let records = self.records.lock().unwrap();
        let mut pending: Vec<OutboxRecord> = records
            .values()
            .filter(|r| r.key == key && r.status == OutboxStatus::New)
            .cloned()
            .collect();
        pending.sort_by_key(|r| (r.created_at, r.id));
        Ok(pending)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        fence: &KeyLock,
    ) -> Result<bool> {
        if !self.fence_holds(fence) {
            return Ok(false);
        }
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&id) {
            Some(record) if record.status == OutboxStatus::New => {
                record.status = OutboxStatus::Completed;
                record.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        failure_count: i32,
        failure_reason: &str,
        fence: &KeyLock,
    ) -> Result<bool> {
        if !self.fence_holds(fence) {
            return Ok(false);
        }
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&id) {
            Some(record) if record.status == OutboxStatus::New => {
                record.status = OutboxStatus::Failed;
                record.failure_count = failure_count;
                record.failure_reason = Some(failure_reason.to_owned());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_retried(
        &self,
        id: Uuid,
        failure_count: i32,
        failure_reason: &str,
        next_retry_at: DateTime<Utc>,
        fence: &KeyLock,
    ) -> Result<bool> {
        if !self.fence_holds(fence) {
            return Ok(false);
        }
        let mut records = self.records.lock().unwrap();
        match records.get_mut(&id) {
            Some(record) if record.status == OutboxStatus::New => {
                record.failure_count = failure_count;
                record.failure_reason = Some(failure_reason.to_owned());
                record.next_retry_at = next_retry_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_status(&self, status: OutboxStatus) -> Result<u64> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| r.status != status);
        Ok((before - records.len()) as u64)
    }

    async fn delete_by_key_and_status(&self, key: &str, status: OutboxStatus) -> Result<u64> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, r| !(r.key == key && r.status == status));
        Ok((before - records.len()) as u64)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn insert(&self, lock: &KeyLock) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        if locks.contains_key(&lock.key) {
            return Ok(false);
        }
        locks.insert(lock.key.clone(), lock.clone());
        Ok(true)
    }

    async fn find(&self, key: &str) -> Result<Option<KeyLock>> {
        Ok(self.locks.lock().unwrap().get(key).cloned())
    }

    async fn compare_and_swap(&self, expected_version: i64, lock: &KeyLock) -> Result<bool> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(&lock.key) {
            Some(existing) if existing.version == expected_version => {
                *existing = lock.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str, version: i64) -> Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(key).map(|l| l.version) == Some(version) {
            locks.remove(key);
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn register(&self, instance: &Instance) -> Result<()> {
        self.instances
            .lock()
            .unwrap()
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(instance_id) {
            instance.last_heartbeat = at;
        }
        Ok(())
    }

    async fn set_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()> {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(instance_id) {
            instance.status = status;
        }
        Ok(())
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut swept = 0;
        for instance in self.instances.lock().unwrap().values_mut() {
            if instance.status == InstanceStatus::Running && instance.last_heartbeat < cutoff {
                instance.status = InstanceStatus::Stopped;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn live(&self, cutoff: DateTime<Utc>) -> Result<Vec<Instance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.status == InstanceStatus::Running && i.last_heartbeat >= cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PartitionStore for MemoryStore {
    async fn count(&self) -> Result<u32> {
        Ok(self.partitions.lock().unwrap().len() as u32)
    }

    async fn init(&self, count: u32, at: DateTime<Utc>) -> Result<()> {
        let mut partitions = self.partitions.lock().unwrap();
        for partition_no in 0..count as i32 {
            partitions
                .entry(partition_no)
                .or_insert_with(|| PartitionAssignment {
                    partition_no,
                    instance_id: None,
                    version: 0,
                    updated_at: at,
                });
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PartitionAssignment>> {
        let mut assignments: Vec<PartitionAssignment> =
            self.partitions.lock().unwrap().values().cloned().collect();
        assignments.sort_by_key(|a| a.partition_no);
        Ok(assignments)
    }

    async fn compare_and_swap_owner(
        &self,
        partition_no: i32,
        expected_version: i64,
        new_owner: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut partitions = self.partitions.lock().unwrap();
        match partitions.get_mut(&partition_no) {
            Some(assignment) if assignment.version == expected_version => {
                assignment.instance_id = new_owner.map(str::to_owned);
                assignment.version += 1;
                assignment.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// =============================================================================
// Scripted handlers
// =============================================================================

/// Records every invocation; optionally sleeps to widen the window for
/// concurrency assertions.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    invocations: Mutex<Vec<(String, serde_json::Value)>>,
    hold: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep each invocation running for `hold` before returning.
    pub fn with_hold(hold: Duration) -> Self {
        Self {
            hold: Some(hold),
            ..Self::default()
        }
    }

    /// `(key, payload)` pairs in invocation order.
    pub fn invocations(&self) -> Vec<(String, serde_json::Value)> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// Highest number of invocations observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(
        &self,
        payload: &serde_json::Value,
        delivery: &Delivery,
    ) -> Result<(), HandlerError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        self.invocations
            .lock()
            .unwrap()
            .push((delivery.key.clone(), payload.clone()));
        if let Some(hold) = self.hold {
            tokio::time::sleep(hold).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails a fixed number of times before succeeding.
#[derive(Debug)]
pub struct FlakyHandler {
    failures: usize,
    kind: String,
    attempts: AtomicUsize,
}

impl FlakyHandler {
    /// Fail `failures` times with a `"timeout"` delivery error, then
    /// succeed forever.
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            kind: "timeout".to_owned(),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Never succeed.
    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for FlakyHandler {
    async fn handle(
        &self,
        _payload: &serde_json::Value,
        delivery: &Delivery,
    ) -> Result<(), HandlerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(HandlerError::delivery(
                self.kind.clone(),
                format!("scripted failure on key {}", delivery.key),
            ))
        } else {
            Ok(())
        }
    }
}

/// Records terminal failures handed to it.
#[derive(Debug, Default)]
pub struct RecordingFallback {
    failures: Mutex<Vec<FailureInfo>>,
}

impl RecordingFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<FailureInfo> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fallback for RecordingFallback {
    async fn handle_failure(
        &self,
        _payload: &serde_json::Value,
        _delivery: &Delivery,
        failure: &FailureInfo,
    ) -> Result<()> {
        self.failures.lock().unwrap().push(failure.clone());
        Ok(())
    }
}
