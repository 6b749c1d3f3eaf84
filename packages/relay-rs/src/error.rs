//! Engine-boundary error types.
//!
//! The boundary rule follows the usual split: store implementations move
//! failures around as `anyhow::Error`, while everything the engine exposes
//! is a structured `thiserror` enum callers can match on. Handler-side
//! errors live next to the handler traits in [`crate::handler`].

use thiserror::Error;

use crate::registry::RegistryError;

/// Fatal engine errors. All of these refuse startup; none of them can
/// occur once the engine is running.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration cannot be honored.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// The partition table disagrees with `partition_count`. Changing the
    /// count requires an offline migration of persisted records.
    #[error("partition count mismatch: store has {found}, configured {configured}")]
    PartitionCountChanged { found: u32, configured: u32 },

    /// A required store was not provided to the builder.
    #[error("missing store: {0}")]
    MissingStore(&'static str),

    /// Broken handler/fallback registration.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A store call failed during startup.
    #[error("store operation failed: {0}")]
    Store(#[from] anyhow::Error),
}

/// Errors on the schedule path.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The payload could not be serialized.
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
