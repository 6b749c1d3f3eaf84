//! sqlx implementation of the lock store.
//!
//! The primary key on `record_key` gives insert-or-conflict acquisition;
//! everything else is a version-guarded `UPDATE`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use relay::store::LockStore;
use relay::KeyLock;

use crate::schema::{SchemaConfig, Tables};

#[derive(Debug, sqlx::FromRow)]
struct LockRow {
    record_key: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    version: i64,
}

impl From<LockRow> for KeyLock {
    fn from(row: LockRow) -> Self {
        KeyLock {
            key: row.record_key,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
            version: row.version,
        }
    }
}

/// PostgreSQL-backed [`LockStore`].
pub struct PgLockStore {
    pool: PgPool,
    tables: Tables,
}

impl PgLockStore {
    pub fn new(pool: PgPool, config: &SchemaConfig) -> Self {
        Self {
            pool,
            tables: Tables::new(config),
        }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn insert(&self, lock: &KeyLock) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO {lock} (record_key, acquired_at, expires_at, version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (record_key) DO NOTHING
            "#,
            lock = self.tables.lock,
        );
        let result = sqlx::query(&sql)
            .bind(&lock.key)
            .bind(lock.acquired_at)
            .bind(lock.expires_at)
            .bind(lock.version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find(&self, key: &str) -> Result<Option<KeyLock>> {
        let sql = format!(
            "SELECT record_key, acquired_at, expires_at, version FROM {lock} WHERE record_key = $1",
            lock = self.tables.lock,
        );
        let row = sqlx::query_as::<_, LockRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(KeyLock::from))
    }

    async fn compare_and_swap(&self, expected_version: i64, lock: &KeyLock) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE {lock}
            SET acquired_at = $2, expires_at = $3, version = $4
            WHERE record_key = $1 AND version = $5
            "#,
            lock = self.tables.lock,
        );
        let result = sqlx::query(&sql)
            .bind(&lock.key)
            .bind(lock.acquired_at)
            .bind(lock.expires_at)
            .bind(lock.version)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str, version: i64) -> Result<()> {
        let sql = format!(
            "DELETE FROM {lock} WHERE record_key = $1 AND version = $2",
            lock = self.tables.lock,
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
