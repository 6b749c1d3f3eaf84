//! Transactional scheduling entry point.
//!
//! [`PgScheduler::schedule`] takes `&mut Transaction<'_, Postgres>`, so a
//! record can only ever be written inside an ambient database transaction
//! and commits or rolls back together with the caller's business writes.
//! That is the whole point of the outbox: the rule is enforced by the
//! signature rather than a runtime check.
//!
//! # Example
//!
//! ```ignore
//! let mut tx = pool.begin().await?;
//!
//! let order = create_order(&cmd, &mut tx).await?;
//! scheduler
//!     .schedule(&mut tx, &OrderPlaced { order_id: order.id }, &order.id.to_string(), None)
//!     .await?;
//!
//! tx.commit().await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use sqlx::{Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use relay::{CreationInterceptor, OutboxPayload, OutboxRecord, Scheduler, SharedClock};

use crate::schema::{SchemaConfig, Tables};

/// Composes records and persists them through the caller's transaction.
pub struct PgScheduler {
    scheduler: Scheduler,
    tables: Tables,
}

impl PgScheduler {
    pub fn new(config: &SchemaConfig, partition_count: u32, clock: SharedClock) -> Self {
        Self {
            scheduler: Scheduler::new(partition_count, clock),
            tables: Tables::new(config),
        }
    }

    /// Append a creation interceptor; it runs on every schedule, in
    /// registration order.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CreationInterceptor>) -> Self {
        self.scheduler = self.scheduler.with_interceptor(interceptor);
        self
    }

    /// Schedule a payload inside the caller's transaction. Returns the
    /// new record's id.
    pub async fn schedule<T: OutboxPayload>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &T,
        key: &str,
        handler_id: Option<&str>,
    ) -> Result<Uuid> {
        let record = self.scheduler.compose(payload, key, handler_id)?;
        let id = record.id;
        self.insert(tx, &record).await?;
        debug!(
            record_id = %id,
            key = %key,
            record_type = T::record_type(),
            partition = record.partition_no,
            "outbox record scheduled"
        );
        Ok(id)
    }

    /// Persist an already composed record inside the caller's transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &OutboxRecord,
    ) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {record}
                (id, record_key, record_type, payload, context, handler_id, status,
                 created_at, completed_at, failure_count, failure_reason,
                 next_retry_at, partition_no)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
            record = self.tables.record,
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(&record.key)
            .bind(&record.record_type)
            .bind(&record.payload)
            .bind(serde_json::to_value(&record.context)?)
            .bind(&record.handler_id)
            .bind(record.status.as_str())
            .bind(record.created_at)
            .bind(record.completed_at)
            .bind(record.failure_count)
            .bind(&record.failure_reason)
            .bind(record.next_retry_at)
            .bind(record.partition_no)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}
