//! Interceptor chains around scheduling and delivery.
//!
//! Two chains exist, composed by iteration in registration order:
//!
//! - **Creation interceptors** run inside `schedule` before the record is
//!   persisted and may contribute to the record's context map (trace ids,
//!   tenant ids, ...).
//! - **Delivery interceptors** wrap every handler invocation:
//!   `before_handler`, then either `after_handler` (success) or `on_error`
//!   (failure), and `after_completion` in every case.

use std::collections::BTreeMap;

use crate::handler::{Delivery, HandlerError};

/// Mutable view of a record-to-be handed to creation interceptors.
#[derive(Debug)]
pub struct ScheduleContext {
    key: String,
    record_type: String,
    handler_id: Option<String>,
    attributes: BTreeMap<String, String>,
}

impl ScheduleContext {
    pub(crate) fn new(key: &str, record_type: &str, handler_id: Option<&str>) -> Self {
        Self {
            key: key.to_owned(),
            record_type: record_type.to_owned(),
            handler_id: handler_id.map(str::to_owned),
            attributes: BTreeMap::new(),
        }
    }

    /// The ordering key being scheduled.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The payload type identifier.
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// The handler token, if one was given.
    pub fn handler_id(&self) -> Option<&str> {
        self.handler_id.as_deref()
    }

    /// Contribute a context attribute. Later interceptors overwrite
    /// earlier values for the same name.
    pub fn insert_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Read back an attribute contributed earlier in the chain.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub(crate) fn into_attributes(self) -> BTreeMap<String, String> {
        self.attributes
    }
}

/// Runs on the schedule path, before the record is persisted.
pub trait CreationInterceptor: Send + Sync {
    fn before_persist(&self, ctx: &mut ScheduleContext);
}

/// Observes each delivery attempt. All methods default to no-ops so
/// implementors override only what they need.
pub trait DeliveryInterceptor: Send + Sync {
    /// Before the handler is resolved and invoked.
    fn before_handler(&self, _delivery: &Delivery) {}

    /// After the handler returned successfully and the completion was
    /// persisted.
    fn after_handler(&self, _delivery: &Delivery) {}

    /// After the handler returned an error, before the retry decision.
    fn on_error(&self, _delivery: &Delivery, _error: &HandlerError) {}

    /// After the attempt concluded, on every path.
    fn after_completion(&self, _delivery: &Delivery) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct TraceContext;

    impl CreationInterceptor for TraceContext {
        fn before_persist(&self, ctx: &mut ScheduleContext) {
            ctx.insert_attribute("trace-id", "abc-123");
        }
    }

    struct TenantTagger;

    impl CreationInterceptor for TenantTagger {
        fn before_persist(&self, ctx: &mut ScheduleContext) {
            // Later interceptors can see earlier contributions.
            assert_eq!(ctx.attribute("trace-id"), Some("abc-123"));
            ctx.insert_attribute("tenant", ctx.key().to_owned());
        }
    }

    #[test]
    fn test_creation_chain_runs_in_order() {
        let chain: Vec<Box<dyn CreationInterceptor>> =
            vec![Box::new(TraceContext), Box::new(TenantTagger)];
        let mut ctx = ScheduleContext::new("acme", "billing.invoice.v1", None);
        for interceptor in &chain {
            interceptor.before_persist(&mut ctx);
        }
        let attrs = ctx.into_attributes();
        assert_eq!(attrs.get("trace-id").map(String::as_str), Some("abc-123"));
        assert_eq!(attrs.get("tenant").map(String::as_str), Some("acme"));
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<&'static str>>,
    }

    impl DeliveryInterceptor for Recording {
        fn before_handler(&self, _: &Delivery) {
            self.calls.lock().unwrap().push("before");
        }
        fn after_handler(&self, _: &Delivery) {
            self.calls.lock().unwrap().push("after");
        }
        fn on_error(&self, _: &Delivery, _: &HandlerError) {
            self.calls.lock().unwrap().push("error");
        }
        fn after_completion(&self, _: &Delivery) {
            self.calls.lock().unwrap().push("completion");
        }
    }

    #[test]
    fn test_delivery_interceptor_defaults_are_noops() {
        struct Silent;
        impl DeliveryInterceptor for Silent {}

        let delivery = Delivery {
            record_id: uuid::Uuid::new_v4(),
            key: "k".into(),
            record_type: "t".into(),
            handler_id: None,
            created_at: chrono::Utc::now(),
            failure_count: 0,
            context: BTreeMap::new(),
        };
        Silent.before_handler(&delivery);
        Silent.after_completion(&delivery);
    }

    #[test]
    fn test_recording_interceptor_sees_all_phases() {
        let recording = Recording::default();
        let delivery = Delivery {
            record_id: uuid::Uuid::new_v4(),
            key: "k".into(),
            record_type: "t".into(),
            handler_id: None,
            created_at: chrono::Utc::now(),
            failure_count: 0,
            context: BTreeMap::new(),
        };
        recording.before_handler(&delivery);
        recording.on_error(&delivery, &HandlerError::delivery("timeout", "x"));
        recording.after_completion(&delivery);
        assert_eq!(
            *recording.calls.lock().unwrap(),
            vec!["before", "error", "completion"]
        );
    }
}
