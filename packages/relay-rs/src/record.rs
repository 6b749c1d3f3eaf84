//! The outbox record: the unit of work the dispatcher delivers.
//!
//! Records are created by the scheduling path inside the producer's database
//! transaction and afterwards mutated only by the dispatch loop: status,
//! failure bookkeeping, and retry timestamps. Everything else is immutable
//! for the lifetime of the record.
//!
//! # Ordering
//!
//! Records sharing a key form a FIFO sequence ordered by
//! `(created_at, id)`. The key's partition number is derived once at
//! creation via [`partition_of`](crate::partition_of) and never changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Delivery state of an outbox record.
///
/// Transitions are one-way: `New -> Completed` or `New -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    /// Pending delivery (includes records waiting for a retry slot).
    New,
    /// Delivered successfully; terminal.
    Completed,
    /// Delivery given up after a non-retryable error or retry exhaustion;
    /// terminal.
    Failed,
}

impl OutboxStatus {
    /// Canonical storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Completed => "COMPLETED",
            OutboxStatus::Failed => "FAILED",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(OutboxStatus::New),
            "COMPLETED" => Some(OutboxStatus::Completed),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }

    /// Whether this status permits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload that can be scheduled through the outbox.
///
/// The record type identifier is persisted alongside the serialized payload
/// and used by handlers to pick the deserializer. Treat it as versioned:
/// a breaking payload change is a new type with a new identifier, so old
/// rows keep deserializing with the old one.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct InvoiceIssued {
///     pub invoice_id: Uuid,
///     pub total_cents: i64,
/// }
///
/// impl OutboxPayload for InvoiceIssued {
///     fn record_type() -> &'static str {
///         "billing.invoice-issued.v1"
///     }
/// }
/// ```
pub trait OutboxPayload: Serialize {
    /// Stable identifier of the payload type.
    fn record_type() -> &'static str;
}

/// A persisted outbox record.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    /// Unique, immutable identifier.
    pub id: Uuid,
    /// Groups records that must be delivered in FIFO order, typically an
    /// aggregate or entity identifier.
    pub key: String,
    /// Payload type identifier, see [`OutboxPayload::record_type`].
    pub record_type: String,
    /// Serialized payload.
    pub payload: serde_json::Value,
    /// Metadata contributed by creation interceptors at schedule time
    /// (trace ids and the like), surfaced to the handler on delivery.
    pub context: BTreeMap<String, String>,
    /// Opaque token selecting the handler. `None` routes to the default
    /// handler if one is registered.
    pub handler_id: Option<String>,
    /// Delivery state.
    pub status: OutboxStatus,
    /// When the record was scheduled.
    pub created_at: DateTime<Utc>,
    /// When delivery succeeded, if it did.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of failed delivery attempts so far. Never decreases.
    pub failure_count: i32,
    /// Message of the most recent failure.
    pub failure_reason: Option<String>,
    /// The record is eligible for delivery once `now >= next_retry_at`.
    pub next_retry_at: DateTime<Utc>,
    /// Partition bucket, fixed at creation from the key.
    pub partition_no: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            OutboxStatus::New,
            OutboxStatus::Completed,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        assert_eq!(OutboxStatus::parse("PENDING"), None);
        assert_eq!(OutboxStatus::parse(""), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OutboxStatus::New.is_terminal());
        assert!(OutboxStatus::Completed.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
    }
}
