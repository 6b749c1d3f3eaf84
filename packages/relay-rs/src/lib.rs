//! # Relay
//!
//! A transactional outbox dispatcher: commit business state and an
//! outgoing message atomically in one database transaction, then deliver
//! the message asynchronously with per-key ordering, automatic retries,
//! fallbacks, and safe horizontal scaling across instances sharing the
//! same database.
//!
//! ## Architecture
//!
//! ```text
//! producer transaction                      dispatcher instance
//! ┌──────────────────────┐      ┌───────────────────────────────────────┐
//! │ business write       │      │ InstanceRegistrar ── heartbeats       │
//! │ Scheduler::compose   │      │ PartitionCoordinator ── CAS leases    │
//! │ INSERT outbox record │      │         │ owned partitions (fence)    │
//! └──────────┬───────────┘      │         ▼                             │
//!            │ commit           │ Dispatcher tick                       │
//!            ▼                  │   eligible keys ─ limiter ─ key lock  │
//!      outbox table ◄───────────│   FIFO records ─ handler ─ retry      │
//!                               └───────────────────────────────────────┘
//! ```
//!
//! The engine is storage-agnostic: persistence sits behind the narrow
//! store traits in [`store`], with a PostgreSQL implementation in the
//! companion `relay-postgres` crate and an in-memory one in [`testing`].
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: every record reaches `COMPLETED` or
//!   `FAILED`; a crash between handler and status update redelivers.
//! - **Per-key FIFO**: records sharing a key are delivered in creation
//!   order; a failing record blocks its key until it succeeds or fails
//!   terminally.
//! - **At-most-one concurrent invocation per key**, cluster-wide,
//!   enforced by partition ownership plus a per-key lock lease.
//! - **No coordinator service**: instances coordinate through optimistic
//!   compare-and-swap rows in the shared database.
//!
//! Not guaranteed: exactly-once delivery, ordering across keys, ordering
//! across partitions.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay::{EngineBuilder, EngineConfig, HandlerRegistry, OutboxPayload};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("invoice-mailer", Arc::new(InvoiceMailer::new(smtp)))?;
//! registry.register_fallback("invoice-mailer", Arc::new(AlertOps::new(pager)))?;
//!
//! let handle = EngineBuilder::new(EngineConfig::default())
//!     .with_record_store(records)
//!     .with_lock_store(locks)
//!     .with_instance_store(instances)
//!     .with_partition_store(partitions)
//!     .with_registry(registry)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! // ... serve traffic; producers schedule records in their own
//! // transactions via the storage adapter ...
//!
//! handle.shutdown().await;
//! ```

// Core modules
mod clock;
mod config;
mod coordinator;
mod dispatch;
mod engine;
mod error;
mod handler;
mod instance;
mod interceptor;
mod limiter;
mod lock;
mod partition;
mod record;
mod registry;
mod retry;
mod schedule;

// Persistence seams (policy-light)
pub mod store;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export clock types
pub use clock::{Clock, SharedClock, SystemClock};

// Re-export configuration
pub use config::{
    EngineConfig, InstanceConfig, LockingConfig, PartitionConfig, RetryConfig, RetryPolicyKind,
};

// Re-export coordination types
pub use coordinator::{PartitionAssignment, PartitionCoordinator};
pub use instance::{Instance, InstanceRegistrar, InstanceStatus};

// Re-export dispatch types
pub use dispatch::Dispatcher;

// Re-export engine types (primary entry point)
pub use engine::{Engine, EngineBuilder, EngineHandle};

// Re-export error types
pub use error::{EngineError, ScheduleError};

// Re-export handler capability set
pub use handler::{decode_payload, Delivery, FailureInfo, Fallback, Handler, HandlerError};

// Re-export interceptor types
pub use interceptor::{CreationInterceptor, DeliveryInterceptor, ScheduleContext};

// Re-export limiter types
pub use limiter::{DrainTimeout, ProcessingLimiter};

// Re-export lock types
pub use lock::{KeyLock, LockManager};

// Re-export partition hashing
pub use partition::partition_of;

// Re-export record types
pub use record::{OutboxPayload, OutboxRecord, OutboxStatus};

// Re-export registry types
pub use registry::{HandlerRegistry, Registration, RegistryError};

// Re-export retry types
pub use retry::{ExponentialBackoff, FixedBackoff, RetryClassifier, RetryPolicy};

// Re-export the schedule-path composer
pub use schedule::Scheduler;

// Re-export commonly used external types
pub use async_trait::async_trait;
