//! Handler and fallback capability set implemented by integrators.
//!
//! A handler consumes a deserialized payload and performs the external
//! delivery (broker publish, HTTP call, mail, ...). A fallback is invoked
//! exactly once when a record moves to `Failed`, either because the error
//! was classified non-retryable or because retries were exhausted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use crate::record::OutboxRecord;
use crate::retry::RetryPolicy;

/// Error surfaced by a handler invocation.
///
/// The variant decides how retry classification sees the failure:
/// - [`HandlerError::Decode`] marks a payload that cannot be interpreted.
///   Retrying cannot fix the bytes, so it is non-retryable by default.
/// - [`HandlerError::Delivery`] carries an integrator-chosen `kind` token
///   that the retry policy's include/exclude lists match against.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The persisted payload could not be deserialized.
    #[error("payload decode failed: {0}")]
    Decode(String),

    /// The delivery itself failed.
    #[error("{kind}: {message}")]
    Delivery {
        /// Classification token, e.g. `"timeout"` or `"rejected"`.
        kind: String,
        /// Human-readable failure message.
        message: String,
    },
}

impl HandlerError {
    /// Build a decode error from any displayable cause.
    pub fn decode(cause: impl std::fmt::Display) -> Self {
        HandlerError::Decode(cause.to_string())
    }

    /// Build a delivery error with a classification token.
    pub fn delivery(kind: impl Into<String>, message: impl std::fmt::Display) -> Self {
        HandlerError::Delivery {
            kind: kind.into(),
            message: message.to_string(),
        }
    }

    /// The classification token retry policies match against.
    pub fn kind(&self) -> &str {
        match self {
            HandlerError::Decode(_) => "decode",
            HandlerError::Delivery { kind, .. } => kind,
        }
    }

    /// Whether this is a payload decode failure.
    pub fn is_decode(&self) -> bool {
        matches!(self, HandlerError::Decode(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::decode(err)
    }
}

/// Decode a persisted payload into a concrete type.
///
/// Failures map to [`HandlerError::Decode`] and are therefore
/// non-retryable by default.
pub fn decode_payload<T: DeserializeOwned>(payload: &serde_json::Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload.clone()).map_err(HandlerError::from)
}

/// Metadata handed to the handler alongside the payload.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Identifier of the record being delivered.
    pub record_id: Uuid,
    /// The record's ordering key.
    pub key: String,
    /// Payload type identifier.
    pub record_type: String,
    /// The opaque handler token persisted on the record, if any.
    pub handler_id: Option<String>,
    /// When the record was scheduled.
    pub created_at: DateTime<Utc>,
    /// Failed attempts before this invocation.
    pub failure_count: i32,
    /// Context map contributed at schedule time.
    pub context: BTreeMap<String, String>,
}

impl Delivery {
    pub(crate) fn for_record(record: &OutboxRecord) -> Self {
        Self {
            record_id: record.id,
            key: record.key.clone(),
            record_type: record.record_type.clone(),
            handler_id: record.handler_id.clone(),
            created_at: record.created_at,
            failure_count: record.failure_count,
            context: record.context.clone(),
        }
    }
}

/// Details of the terminal failure passed to a fallback.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    /// Classification token of the final error.
    pub kind: String,
    /// Message of the final error.
    pub message: String,
    /// Total failed attempts, including the final one.
    pub failure_count: i32,
    /// When the final attempt ran.
    pub last_retry_at: DateTime<Utc>,
}

/// Delivers a payload to its external destination.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Deliver one record. Returning `Ok` completes the record; returning
    /// an error routes it through retry classification.
    async fn handle(
        &self,
        payload: &serde_json::Value,
        delivery: &Delivery,
    ) -> Result<(), HandlerError>;

    /// Per-handler retry policy override. `None` uses the engine default.
    fn retry_policy(&self) -> Option<Arc<dyn RetryPolicy>> {
        None
    }
}

/// Invoked once when a record moves to `Failed`.
///
/// Fallback errors are logged and swallowed; the record stays `Failed`.
#[async_trait]
pub trait Fallback: Send + Sync {
    async fn handle_failure(
        &self,
        payload: &serde_json::Value,
        delivery: &Delivery,
        failure: &FailureInfo,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
    }

    #[test]
    fn test_decode_payload_ok() {
        let value = serde_json::json!({ "seq": 7 });
        let ping: Ping = decode_payload(&value).unwrap();
        assert_eq!(ping, Ping { seq: 7 });
    }

    #[test]
    fn test_decode_payload_failure_is_decode_kind() {
        let value = serde_json::json!({ "wrong": true });
        let err = decode_payload::<Ping>(&value).unwrap_err();
        assert!(err.is_decode());
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_delivery_error_kind() {
        let err = HandlerError::delivery("timeout", "broker unreachable");
        assert_eq!(err.kind(), "timeout");
        assert!(!err.is_decode());
        assert_eq!(err.to_string(), "timeout: broker unreachable");
    }
}
