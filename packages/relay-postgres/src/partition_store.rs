//! sqlx implementation of the partition store.
//!
//! Ownership transfer is a single version-guarded `UPDATE`; a lost race
//! affects nothing and the coordinator retries next tick.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use relay::store::PartitionStore;
use relay::PartitionAssignment;

use crate::schema::{SchemaConfig, Tables};

#[derive(Debug, sqlx::FromRow)]
struct PartitionRow {
    partition_no: i32,
    instance_id: Option<String>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl From<PartitionRow> for PartitionAssignment {
    fn from(row: PartitionRow) -> Self {
        PartitionAssignment {
            partition_no: row.partition_no,
            instance_id: row.instance_id,
            version: row.version,
            updated_at: row.updated_at,
        }
    }
}

/// PostgreSQL-backed [`PartitionStore`].
pub struct PgPartitionStore {
    pool: PgPool,
    tables: Tables,
}

impl PgPartitionStore {
    pub fn new(pool: PgPool, config: &SchemaConfig) -> Self {
        Self {
            pool,
            tables: Tables::new(config),
        }
    }
}

#[async_trait]
impl PartitionStore for PgPartitionStore {
    async fn count(&self) -> Result<u32> {
        let sql = format!(
            "SELECT COUNT(*) FROM {partition}",
            partition = self.tables.partition,
        );
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count as u32)
    }

    async fn init(&self, count: u32, at: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {partition} (partition_no, instance_id, version, updated_at)
            SELECT gs, NULL, 0, $2 FROM generate_series(0, $1 - 1) AS gs
            ON CONFLICT (partition_no) DO NOTHING
            "#,
            partition = self.tables.partition,
        );
        sqlx::query(&sql)
            .bind(count as i32)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PartitionAssignment>> {
        let sql = format!(
            r#"
            SELECT partition_no, instance_id, version, updated_at
            FROM {partition}
            ORDER BY partition_no
            "#,
            partition = self.tables.partition,
        );
        let rows = sqlx::query_as::<_, PartitionRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PartitionAssignment::from).collect())
    }

    async fn compare_and_swap_owner(
        &self,
        partition_no: i32,
        expected_version: i64,
        new_owner: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {partition}
            SET instance_id = $3, version = version + 1, updated_at = $4
            WHERE partition_no = $1 AND version = $2
            "#,
            partition = self.tables.partition,
        );
        let result = sqlx::query(&sql)
            .bind(partition_no)
            .bind(expected_version)
            .bind(new_owner)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
