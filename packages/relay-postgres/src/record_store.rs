//! sqlx implementation of the record store.
//!
//! Status transitions are fenced against the lock table in the same
//! statement: the `UPDATE` only applies while a lock row for the record's
//! key still carries the caller's version. A fenced-out update changes
//! nothing and reports `false`, exactly like the in-memory store.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use relay::store::RecordStore;
use relay::{KeyLock, OutboxRecord, OutboxStatus};

use crate::schema::{SchemaConfig, Tables};

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    record_key: String,
    record_type: String,
    payload: serde_json::Value,
    context: Option<serde_json::Value>,
    handler_id: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failure_count: i32,
    failure_reason: Option<String>,
    next_retry_at: DateTime<Utc>,
    partition_no: i32,
}

impl TryFrom<RecordRow> for OutboxRecord {
    type Error = anyhow::Error;

    fn try_from(row: RecordRow) -> Result<Self> {
        let status = OutboxStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("unknown record status `{}`", row.status))?;
        let context: BTreeMap<String, String> = match row.context {
            Some(value) => serde_json::from_value(value)?,
            None => BTreeMap::new(),
        };
        Ok(OutboxRecord {
            id: row.id,
            key: row.record_key,
            record_type: row.record_type,
            payload: row.payload,
            context,
            handler_id: row.handler_id,
            status,
            created_at: row.created_at,
            completed_at: row.completed_at,
            failure_count: row.failure_count,
            failure_reason: row.failure_reason,
            next_retry_at: row.next_retry_at,
            partition_no: row.partition_no,
        })
    }
}

/// PostgreSQL-backed [`RecordStore`].
pub struct PgRecordStore {
    pool: PgPool,
    tables: Tables,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, config: &SchemaConfig) -> Self {
        Self {
            pool,
            tables: Tables::new(config),
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn eligible_keys(
        &self,
        partition_no: i32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let sql = format!(
            r#"
            SELECT record_key
            FROM {record}
            WHERE partition_no = $1 AND status = 'NEW' AND next_retry_at <= $2
            GROUP BY record_key
            ORDER BY MIN(created_at), MIN(id::text)
            LIMIT $3
            "#,
            record = self.tables.record,
        );
        let keys = sqlx::query_scalar::<_, String>(&sql)
            .bind(partition_no)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    async fn pending_for_key(&self, key: &str) -> Result<Vec<OutboxRecord>> {
        let sql = format!(
            r#"
            SELECT id, record_key, record_type, payload, context, handler_id, status,
                   created_at, completed_at, failure_count, failure_reason,
                   next_retry_at, partition_no
            FROM {record}
            WHERE record_key = $1 AND status = 'NEW'
            ORDER BY created_at, id
            "#,
            record = self.tables.record,
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OutboxRecord::try_from).collect()
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        fence: &KeyLock,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {record}
            SET status = 'COMPLETED', completed_at = $2
            WHERE id = $1 AND status = 'NEW'
              AND EXISTS (
                  SELECT 1 FROM {lock}
                  WHERE record_key = $3 AND version = $4
              )
            "#,
            record = self.tables.record,
            lock = self.tables.lock,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(completed_at)
            .bind(&fence.key)
            .bind(fence.version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        failure_count: i32,
        failure_reason: &str,
        fence: &KeyLock,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {record}
            SET status = 'FAILED', failure_count = $2, failure_reason = $3
            WHERE id = $1 AND status = 'NEW'
              AND EXISTS (
                  SELECT 1 FROM {lock}
                  WHERE record_key = $4 AND version = $5
              )
            "#,
            record = self.tables.record,
            lock = self.tables.lock,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(failure_count)
            .bind(failure_reason)
            .bind(&fence.key)
            .bind(fence.version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_retried(
        &self,
        id: Uuid,
        failure_count: i32,
        failure_reason: &str,
        next_retry_at: DateTime<Utc>,
        fence: &KeyLock,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {record}
            SET failure_count = $2, failure_reason = $3, next_retry_at = $4
            WHERE id = $1 AND status = 'NEW'
              AND EXISTS (
                  SELECT 1 FROM {lock}
                  WHERE record_key = $5 AND version = $6
              )
            "#,
            record = self.tables.record,
            lock = self.tables.lock,
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(failure_count)
            .bind(failure_reason)
            .bind(next_retry_at)
            .bind(&fence.key)
            .bind(fence.version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_by_status(&self, status: OutboxStatus) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {record} WHERE status = $1",
            record = self.tables.record,
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_key_and_status(&self, key: &str, status: OutboxStatus) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {record} WHERE record_key = $1 AND status = $2",
            record = self.tables.record,
        );
        let result = sqlx::query(&sql)
            .bind(key)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
