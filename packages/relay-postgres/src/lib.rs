//! PostgreSQL persistence for the `relay` transactional outbox.
//!
//! Implements the engine's four store traits over sqlx plus the
//! transactional scheduling entry point, and bootstraps the schema:
//!
//! ```sql
//! CREATE TABLE outbox_record (
//!     id UUID PRIMARY KEY,
//!     record_key TEXT NOT NULL,
//!     record_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     context JSONB,
//!     handler_id TEXT,
//!     status TEXT NOT NULL,            -- NEW | COMPLETED | FAILED
//!     created_at TIMESTAMPTZ NOT NULL,
//!     completed_at TIMESTAMPTZ,
//!     failure_count INT NOT NULL DEFAULT 0,
//!     failure_reason TEXT,
//!     next_retry_at TIMESTAMPTZ NOT NULL,
//!     partition_no INT NOT NULL
//! );
//! -- plus outbox_lock, outbox_instance, outbox_partition; see schema.rs
//! ```
//!
//! All cross-process coordination is optimistic: lock and partition rows
//! mutate only through version-guarded `UPDATE`s, and record status
//! transitions carry a `WHERE EXISTS` fence against the lock table.
//!
//! # Usage
//!
//! ```ignore
//! use relay::{EngineBuilder, EngineConfig};
//! use relay_postgres::{
//!     ensure_schema, PgInstanceStore, PgLockStore, PgPartitionStore,
//!     PgRecordStore, PgScheduler, SchemaConfig,
//! };
//!
//! let config = SchemaConfig::default();
//! ensure_schema(&pool, &config).await?;
//!
//! let handle = EngineBuilder::new(EngineConfig::default())
//!     .with_record_store(Arc::new(PgRecordStore::new(pool.clone(), &config)))
//!     .with_lock_store(Arc::new(PgLockStore::new(pool.clone(), &config)))
//!     .with_instance_store(Arc::new(PgInstanceStore::new(pool.clone(), &config)))
//!     .with_partition_store(Arc::new(PgPartitionStore::new(pool.clone(), &config)))
//!     .with_registry(registry)
//!     .build()?
//!     .start()
//!     .await?;
//! ```

mod instance_store;
mod lock_store;
mod partition_store;
mod record_store;
mod scheduler;
mod schema;

pub use instance_store::PgInstanceStore;
pub use lock_store::PgLockStore;
pub use partition_store::PgPartitionStore;
pub use record_store::PgRecordStore;
pub use scheduler::PgScheduler;
pub use schema::{ensure_schema, SchemaConfig};
