//! The schedule path: composing a record for same-transaction persistence.
//!
//! `Scheduler::compose` is pure with respect to storage: it serializes the
//! payload, runs the creation interceptor chain over the context map, and
//! stamps the partition number and retry fields. A storage adapter then
//! persists the returned record inside the caller's database transaction,
//! which is what makes the outbox transactional: the business write and
//! the record commit or roll back together.

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::error::ScheduleError;
use crate::interceptor::{CreationInterceptor, ScheduleContext};
use crate::partition::partition_of;
use crate::record::{OutboxPayload, OutboxRecord, OutboxStatus};

/// Composes outbox records on the schedule path.
pub struct Scheduler {
    partition_count: u32,
    clock: SharedClock,
    interceptors: Vec<Arc<dyn CreationInterceptor>>,
}

impl Scheduler {
    pub fn new(partition_count: u32, clock: SharedClock) -> Self {
        Self {
            partition_count,
            clock,
            interceptors: Vec::new(),
        }
    }

    /// Append a creation interceptor. Interceptors run in registration
    /// order on every `compose`.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CreationInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Compose a record for a typed payload.
    pub fn compose<T: OutboxPayload>(
        &self,
        payload: &T,
        key: &str,
        handler_id: Option<&str>,
    ) -> Result<OutboxRecord, ScheduleError> {
        let value = serde_json::to_value(payload)?;
        Ok(self.compose_raw(T::record_type(), value, key, handler_id))
    }

    /// Compose a record from an already serialized payload.
    pub fn compose_raw(
        &self,
        record_type: &str,
        payload: serde_json::Value,
        key: &str,
        handler_id: Option<&str>,
    ) -> OutboxRecord {
        let mut ctx = ScheduleContext::new(key, record_type, handler_id);
        for interceptor in &self.interceptors {
            interceptor.before_persist(&mut ctx);
        }
        let now = self.clock.now();
        OutboxRecord {
            id: Uuid::new_v4(),
            key: key.to_owned(),
            record_type: record_type.to_owned(),
            payload,
            context: ctx.into_attributes(),
            handler_id: handler_id.map(str::to_owned),
            status: OutboxStatus::New,
            created_at: now,
            completed_at: None,
            failure_count: 0,
            failure_reason: None,
            next_retry_at: now,
            partition_no: partition_of(key, self.partition_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::testing::ManualClock;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
    }

    impl OutboxPayload for OrderPlaced {
        fn record_type() -> &'static str {
            "orders.placed.v1"
        }
    }

    struct TraceId;

    impl CreationInterceptor for TraceId {
        fn before_persist(&self, ctx: &mut ScheduleContext) {
            ctx.insert_attribute("trace-id", "t-1");
        }
    }

    #[test]
    fn test_compose_stamps_new_record() {
        let clock = Arc::new(ManualClock::epoch());
        let scheduler = Scheduler::new(8, clock.clone());

        let record = scheduler
            .compose(&OrderPlaced { order_id: 9 }, "order-9", Some("broker"))
            .unwrap();

        assert_eq!(record.status, OutboxStatus::New);
        assert_eq!(record.key, "order-9");
        assert_eq!(record.record_type, "orders.placed.v1");
        assert_eq!(record.handler_id.as_deref(), Some("broker"));
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.created_at, clock.now());
        assert_eq!(record.next_retry_at, clock.now());
        assert_eq!(record.partition_no, partition_of("order-9", 8));
        assert_eq!(record.payload, serde_json::json!({ "order_id": 9 }));
    }

    #[test]
    fn test_compose_applies_creation_interceptors() {
        let clock = Arc::new(ManualClock::epoch());
        let scheduler = Scheduler::new(8, clock).with_interceptor(Arc::new(TraceId));

        let record = scheduler
            .compose(&OrderPlaced { order_id: 1 }, "order-1", None)
            .unwrap();

        assert_eq!(record.context.get("trace-id").map(String::as_str), Some("t-1"));
        assert!(record.handler_id.is_none());
    }
}
