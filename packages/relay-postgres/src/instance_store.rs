//! sqlx implementation of the instance store.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use relay::store::InstanceStore;
use relay::{Instance, InstanceStatus};

use crate::schema::{SchemaConfig, Tables};

#[derive(Debug, sqlx::FromRow)]
struct InstanceRow {
    instance_id: String,
    hostname: String,
    port: i32,
    status: String,
    started_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = anyhow::Error;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let status = InstanceStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("unknown instance status `{}`", row.status))?;
        Ok(Instance {
            instance_id: row.instance_id,
            hostname: row.hostname,
            port: row.port as u16,
            status,
            started_at: row.started_at,
            last_heartbeat: row.last_heartbeat,
        })
    }
}

/// PostgreSQL-backed [`InstanceStore`].
pub struct PgInstanceStore {
    pool: PgPool,
    tables: Tables,
}

impl PgInstanceStore {
    pub fn new(pool: PgPool, config: &SchemaConfig) -> Self {
        Self {
            pool,
            tables: Tables::new(config),
        }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn register(&self, instance: &Instance) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {instance} (instance_id, hostname, port, status, started_at, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (instance_id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                port = EXCLUDED.port,
                status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                last_heartbeat = EXCLUDED.last_heartbeat
            "#,
            instance = self.tables.instance,
        );
        sqlx::query(&sql)
            .bind(&instance.instance_id)
            .bind(&instance.hostname)
            .bind(instance.port as i32)
            .bind(instance.status.as_str())
            .bind(instance.started_at)
            .bind(instance.last_heartbeat)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            "UPDATE {instance} SET last_heartbeat = $2 WHERE instance_id = $1",
            instance = self.tables.instance,
        );
        sqlx::query(&sql)
            .bind(instance_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_status(&self, instance_id: &str, status: InstanceStatus) -> Result<()> {
        let sql = format!(
            "UPDATE {instance} SET status = $2 WHERE instance_id = $1",
            instance = self.tables.instance,
        );
        sqlx::query(&sql)
            .bind(instance_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "UPDATE {instance} SET status = 'STOPPED' \
             WHERE status = 'RUNNING' AND last_heartbeat < $1",
            instance = self.tables.instance,
        );
        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn live(&self, cutoff: DateTime<Utc>) -> Result<Vec<Instance>> {
        let sql = format!(
            r#"
            SELECT instance_id, hostname, port, status, started_at, last_heartbeat
            FROM {instance}
            WHERE status = 'RUNNING' AND last_heartbeat >= $1
            "#,
            instance = self.tables.instance,
        );
        let rows = sqlx::query_as::<_, InstanceRow>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Instance::try_from).collect()
    }
}
