//! Table naming and schema bootstrap.
//!
//! All four tables live wherever [`SchemaConfig`] points: an optional
//! schema plus an optional table prefix, so several outboxes can share
//! one database. [`ensure_schema`] issues `CREATE ... IF NOT EXISTS`
//! statements and is safe to run on every startup.

use anyhow::Result;
use sqlx::PgPool;
use tracing::debug;

/// Where the outbox tables live.
#[derive(Debug, Clone, Default)]
pub struct SchemaConfig {
    /// Optional schema; `None` uses the connection's default search path.
    pub schema: Option<String>,
    /// Optional prefix prepended to every table and index name.
    pub table_prefix: Option<String>,
}

impl SchemaConfig {
    fn prefix(&self) -> &str {
        self.table_prefix.as_deref().unwrap_or("")
    }

    fn qualified(&self, base: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}{}", schema, self.prefix(), base),
            None => format!("{}{}", self.prefix(), base),
        }
    }
}

/// Resolved table names, built once per store.
#[derive(Debug, Clone)]
pub(crate) struct Tables {
    pub record: String,
    pub lock: String,
    pub instance: String,
    pub partition: String,
}

impl Tables {
    pub(crate) fn new(config: &SchemaConfig) -> Self {
        Self {
            record: config.qualified("outbox_record"),
            lock: config.qualified("outbox_lock"),
            instance: config.qualified("outbox_instance"),
            partition: config.qualified("outbox_partition"),
        }
    }
}

/// Create the outbox tables and indices if they do not exist.
pub async fn ensure_schema(pool: &PgPool, config: &SchemaConfig) -> Result<()> {
    let tables = Tables::new(config);
    let prefix = config.prefix();

    if let Some(schema) = &config.schema {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .execute(pool)
            .await?;
    }

    let statements = [
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {record} (
                id UUID PRIMARY KEY,
                record_key TEXT NOT NULL,
                record_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                context JSONB,
                handler_id TEXT,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                failure_count INT NOT NULL DEFAULT 0,
                failure_reason TEXT,
                next_retry_at TIMESTAMPTZ NOT NULL,
                partition_no INT NOT NULL
            )
            "#,
            record = tables.record,
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {lock} (
                record_key TEXT PRIMARY KEY,
                acquired_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                version BIGINT NOT NULL
            )
            "#,
            lock = tables.lock,
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {instance} (
                instance_id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                port INT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                last_heartbeat TIMESTAMPTZ NOT NULL
            )
            "#,
            instance = tables.instance,
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {partition} (
                partition_no INT PRIMARY KEY,
                instance_id TEXT,
                version BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            partition = tables.partition,
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}outbox_record_partition_idx \
             ON {record} (partition_no, status, next_retry_at)",
            record = tables.record,
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}outbox_record_status_idx \
             ON {record} (status, next_retry_at)",
            record = tables.record,
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}outbox_record_key_idx \
             ON {record} (record_key, created_at)",
            record = tables.record,
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}outbox_instance_heartbeat_idx \
             ON {instance} (status, last_heartbeat)",
            instance = tables.instance,
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {prefix}outbox_partition_instance_idx \
             ON {partition} (instance_id)",
            partition = tables.partition,
        ),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!(prefix = %prefix, schema = ?config.schema, "outbox schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_bare_names() {
        let tables = Tables::new(&SchemaConfig::default());
        assert_eq!(tables.record, "outbox_record");
        assert_eq!(tables.lock, "outbox_lock");
    }

    #[test]
    fn test_prefix_and_schema_compose() {
        let tables = Tables::new(&SchemaConfig {
            schema: Some("messaging".into()),
            table_prefix: Some("app_".into()),
        });
        assert_eq!(tables.record, "messaging.app_outbox_record");
        assert_eq!(tables.partition, "messaging.app_outbox_partition");
    }
}
