//! The dispatch loop.
//!
//! One call to [`Dispatcher::run_tick`] is one tick. Per tick:
//!
//! ```text
//! owned partitions (coordinator snapshot = the fence)
//!     │  concurrently, capped at the limiter capacity
//!     ▼
//! eligible keys in partition (oldest pending record first)
//!     │  per key
//!     ├─► limiter permit (skipped when shutting down)
//!     ├─► per-key lock   (skipped when held elsewhere)
//!     ▼
//! pending records in (created_at, id) order
//!     ├─► delivery interceptors + handler
//!     ├─► fenced status update (completed / retried / failed+fallback)
//!     └─► lock renewal between records; a lost lease aborts the key
//! ```
//!
//! Ordering is enforced three ways: partition ownership keeps a key on one
//! instance, the per-key lock keeps it on one worker, and the loop stops
//! at the first record that fails or is not yet due, so nothing ever
//! skips ahead within a key.
//!
//! Handler errors never escape this module; every outcome becomes a
//! record state transition. Store errors abort the current key and are
//! logged; the loop itself survives them.

use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::clock::{to_delta, Clock, SharedClock};
use crate::coordinator::PartitionCoordinator;
use crate::handler::{Delivery, FailureInfo, Fallback, Handler, HandlerError};
use crate::limiter::ProcessingLimiter;
use crate::lock::{KeyLock, LockManager};
use crate::record::OutboxRecord;
use crate::registry::HandlerRegistry;
use crate::retry::RetryPolicy;
use crate::store::RecordStore;

/// What processing one record means for the rest of its key this tick.
enum Outcome {
    /// The record reached a terminal state; continue with the next one.
    Continue,
    /// Stop the key: rescheduled for retry, fenced out, unresolved
    /// handler, or a store failure.
    StopKey,
}

/// Processes owned partitions. Driven by the engine's poll loop or, for
/// an external trigger, by calling [`run_tick`](Dispatcher::run_tick)
/// directly.
pub struct Dispatcher {
    records: Arc<dyn RecordStore>,
    locks: LockManager,
    registry: Arc<HandlerRegistry>,
    limiter: Arc<ProcessingLimiter>,
    coordinator: Arc<PartitionCoordinator>,
    interceptors: Vec<Arc<dyn crate::interceptor::DeliveryInterceptor>>,
    default_policy: Arc<dyn RetryPolicy>,
    clock: SharedClock,
    batch_size: usize,
    tick_parallelism: usize,
    lease_check_interval: Duration,
    shutdown: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        records: Arc<dyn RecordStore>,
        locks: LockManager,
        registry: Arc<HandlerRegistry>,
        limiter: Arc<ProcessingLimiter>,
        coordinator: Arc<PartitionCoordinator>,
        interceptors: Vec<Arc<dyn crate::interceptor::DeliveryInterceptor>>,
        default_policy: Arc<dyn RetryPolicy>,
        clock: SharedClock,
        batch_size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let tick_parallelism = limiter.capacity();
        let lease_check_interval = locks.refresh_threshold().max(Duration::from_millis(50));
        Self {
            records,
            locks,
            registry,
            limiter,
            coordinator,
            interceptors,
            default_policy,
            clock,
            batch_size,
            tick_parallelism,
            lease_check_interval,
            shutdown,
        }
    }

    /// Run one tick over the partitions this instance currently owns.
    pub async fn run_tick(&self) {
        let owned = self.coordinator.owned_partitions();
        if owned.is_empty() {
            trace!("no owned partitions this tick");
            return;
        }
        trace!(partitions = owned.len(), "dispatch tick");
        stream::iter(owned)
            .for_each_concurrent(self.tick_parallelism, |partition| {
                self.process_partition(partition)
            })
            .await;
    }

    async fn process_partition(&self, partition_no: i32) {
        let now = self.clock.now();
        let keys = match self
            .records
            .eligible_keys(partition_no, now, self.batch_size)
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                error!(partition = partition_no, error = %e, "failed to list eligible keys");
                return;
            }
        };
        for key in keys {
            if self.shutdown.is_cancelled() {
                break;
            }
            if !self.limiter.acquire(&key, &self.shutdown).await {
                break;
            }
            self.process_key(&key).await;
            self.limiter.release(&key);
        }
    }

    async fn process_key(&self, key: &str) {
        let mut lock = match self.locks.acquire(key).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                debug!(key = %key, "key locked by another worker, skipping");
                return;
            }
            Err(e) => {
                error!(key = %key, error = %e, "lock acquisition failed");
                return;
            }
        };

        let records = match self.records.pending_for_key(key).await {
            Ok(records) => records,
            Err(e) => {
                error!(key = %key, error = %e, "failed to load pending records");
                self.release_lock(&lock).await;
                return;
            }
        };

        let mut first = true;
        for record in &records {
            if !first {
                match self.locks.renew(&lock).await {
                    Ok(Some(renewed)) => lock = renewed,
                    Ok(None) => {
                        // The lease was overtaken; the row is no longer
                        // ours to delete, so leave without releasing.
                        warn!(key = %key, "lost key lease mid-batch, aborting key");
                        return;
                    }
                    Err(e) => {
                        error!(key = %key, error = %e, "lock renewal failed");
                        return;
                    }
                }
            }
            first = false;

            if self.clock.now() < record.next_retry_at {
                // Head of the key is waiting for its retry slot; FIFO
                // forbids skipping past it.
                break;
            }

            match self.process_record(record, &mut lock).await {
                Outcome::Continue => {}
                Outcome::StopKey => break,
            }
        }

        self.release_lock(&lock).await;
    }

    async fn release_lock(&self, lock: &KeyLock) {
        if let Err(e) = self.locks.release(lock).await {
            warn!(key = %lock.key, error = %e, "failed to release key lock");
        }
    }

    /// Drive the handler while keeping the key lease alive: whenever the
    /// invocation outlives the refresh threshold, the lease is extended in
    /// the background. A lease lost mid-invocation does not cancel the
    /// handler; the fenced status update simply refuses to persist.
    async fn invoke_renewing(
        &self,
        handler: &Arc<dyn Handler>,
        payload: &serde_json::Value,
        delivery: &Delivery,
        lock: &mut KeyLock,
    ) -> Result<(), HandlerError> {
        let mut invocation = pin!(handler.handle(payload, delivery));
        loop {
            tokio::select! {
                result = &mut invocation => return result,
                _ = tokio::time::sleep(self.lease_check_interval) => {
                    match self.locks.renew(lock).await {
                        Ok(Some(renewed)) => *lock = renewed,
                        Ok(None) => {
                            warn!(key = %lock.key, "key lease lost during handler invocation");
                            return invocation.await;
                        }
                        Err(e) => {
                            warn!(key = %lock.key, error = %e, "lease renewal failed during invocation");
                        }
                    }
                }
            }
        }
    }

    async fn process_record(&self, record: &OutboxRecord, lock: &mut KeyLock) -> Outcome {
        let delivery = Delivery::for_record(record);
        for interceptor in &self.interceptors {
            interceptor.before_handler(&delivery);
        }

        let Some(registration) = self.registry.resolve(record.handler_id.as_deref()) else {
            warn!(
                record_id = %record.id,
                handler_id = ?record.handler_id,
                "no handler resolved, leaving record for a later tick"
            );
            self.after_completion(&delivery);
            return Outcome::StopKey;
        };
        let policy = registration
            .handler
            .retry_policy()
            .unwrap_or_else(|| Arc::clone(&self.default_policy));

        let result = self
            .invoke_renewing(&registration.handler, &record.payload, &delivery, lock)
            .await;
        let outcome = match result {
            Ok(()) => self.complete(record, &delivery, lock).await,
            Err(err) => {
                for interceptor in &self.interceptors {
                    interceptor.on_error(&delivery, &err);
                }
                self.fail(
                    record,
                    &delivery,
                    registration.fallback.clone(),
                    policy.as_ref(),
                    err,
                    lock,
                )
                .await
            }
        };

        self.after_completion(&delivery);
        outcome
    }

    fn after_completion(&self, delivery: &Delivery) {
        for interceptor in &self.interceptors {
            interceptor.after_completion(delivery);
        }
    }

    async fn complete(&self, record: &OutboxRecord, delivery: &Delivery, lock: &KeyLock) -> Outcome {
        let completed_at = self.clock.now();
        match self.records.mark_completed(record.id, completed_at, lock).await {
            Ok(true) => {
                debug!(record_id = %record.id, key = %record.key, "record completed");
                for interceptor in &self.interceptors {
                    interceptor.after_handler(delivery);
                }
                Outcome::Continue
            }
            Ok(false) => {
                // Another instance overtook the lease while the handler
                // ran; its view of the record wins.
                warn!(record_id = %record.id, key = %record.key, "completion fenced out");
                Outcome::StopKey
            }
            Err(e) => {
                error!(record_id = %record.id, error = %e, "failed to persist completion");
                Outcome::StopKey
            }
        }
    }

    async fn fail(
        &self,
        record: &OutboxRecord,
        delivery: &Delivery,
        fallback: Option<Arc<dyn Fallback>>,
        policy: &dyn RetryPolicy,
        err: HandlerError,
        lock: &KeyLock,
    ) -> Outcome {
        let failure_count = record.failure_count + 1;
        let now = self.clock.now();
        let exhausted = failure_count > policy.max_retries();

        if exhausted || !policy.should_retry(&err) {
            if let Some(fallback) = fallback {
                let failure = FailureInfo {
                    kind: err.kind().to_owned(),
                    message: err.to_string(),
                    failure_count,
                    last_retry_at: now,
                };
                if let Err(fe) = fallback
                    .handle_failure(&record.payload, delivery, &failure)
                    .await
                {
                    // Fallbacks get exactly one shot; their errors are
                    // logged and swallowed.
                    error!(record_id = %record.id, key = %record.key, error = %fe, "fallback failed");
                }
            }
            match self
                .records
                .mark_failed(record.id, failure_count, &err.to_string(), lock)
                .await
            {
                Ok(true) => {
                    warn!(
                        record_id = %record.id,
                        key = %record.key,
                        failure_count,
                        error = %err,
                        "record failed terminally"
                    );
                    // Terminal state reached; the key is unblocked.
                    Outcome::Continue
                }
                Ok(false) => {
                    warn!(record_id = %record.id, key = %record.key, "failure update fenced out");
                    Outcome::StopKey
                }
                Err(e) => {
                    error!(record_id = %record.id, error = %e, "failed to persist failure");
                    Outcome::StopKey
                }
            }
        } else {
            let next_retry_at = now + to_delta(policy.next_delay(failure_count));
            match self
                .records
                .mark_retried(record.id, failure_count, &err.to_string(), next_retry_at, lock)
                .await
            {
                Ok(true) => {
                    debug!(
                        record_id = %record.id,
                        key = %record.key,
                        failure_count,
                        next_retry_at = %next_retry_at,
                        error = %err,
                        "record rescheduled for retry"
                    );
                }
                Ok(false) => {
                    warn!(record_id = %record.id, key = %record.key, "retry update fenced out");
                }
                Err(e) => {
                    error!(record_id = %record.id, error = %e, "failed to persist retry");
                }
            }
            // A failing record blocks newer records for its key.
            Outcome::StopKey
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("batch_size", &self.batch_size)
            .field("tick_parallelism", &self.tick_parallelism)
            .finish_non_exhaustive()
    }
}
