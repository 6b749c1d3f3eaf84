//! Handler registration and resolution.
//!
//! Integrators register `(handler_id, handler, optional fallback)` triples
//! at startup; the dispatch loop resolves the token persisted on each
//! record. The token is opaque: it is compared for equality and never
//! parsed. Records without a token route to the default handler, if one
//! is registered; records whose token resolves to nothing stay `NEW` and
//! wait for a later deployment that knows the handler.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::handler::{Fallback, Handler};

/// Duplicate or dangling registrations. All of these are startup errors;
/// the engine refuses to build with a broken registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler already registered for id `{0}`")]
    DuplicateHandler(String),

    #[error("fallback already registered for id `{0}`")]
    DuplicateFallback(String),

    #[error("cannot register fallback for unknown handler id `{0}`")]
    UnknownHandler(String),

    #[error("default handler already registered")]
    DuplicateDefault,

    #[error("default fallback already registered")]
    DuplicateDefaultFallback,

    #[error("cannot register default fallback without a default handler")]
    MissingDefaultHandler,
}

/// A resolved handler together with its optional fallback.
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn Handler>,
    pub fallback: Option<Arc<dyn Fallback>>,
}

/// Maps handler tokens to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    by_id: HashMap<String, Registration>,
    default: Option<Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a token.
    pub fn register(
        &mut self,
        handler_id: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<(), RegistryError> {
        let handler_id = handler_id.into();
        if self.by_id.contains_key(&handler_id) {
            return Err(RegistryError::DuplicateHandler(handler_id));
        }
        self.by_id.insert(
            handler_id,
            Registration {
                handler,
                fallback: None,
            },
        );
        Ok(())
    }

    /// Attach a fallback to an already registered handler.
    pub fn register_fallback(
        &mut self,
        handler_id: &str,
        fallback: Arc<dyn Fallback>,
    ) -> Result<(), RegistryError> {
        let registration = self
            .by_id
            .get_mut(handler_id)
            .ok_or_else(|| RegistryError::UnknownHandler(handler_id.to_owned()))?;
        if registration.fallback.is_some() {
            return Err(RegistryError::DuplicateFallback(handler_id.to_owned()));
        }
        registration.fallback = Some(fallback);
        Ok(())
    }

    /// Register the handler for records scheduled without a token.
    pub fn register_default(&mut self, handler: Arc<dyn Handler>) -> Result<(), RegistryError> {
        if self.default.is_some() {
            return Err(RegistryError::DuplicateDefault);
        }
        self.default = Some(Registration {
            handler,
            fallback: None,
        });
        Ok(())
    }

    /// Attach a fallback to the default handler.
    pub fn register_default_fallback(
        &mut self,
        fallback: Arc<dyn Fallback>,
    ) -> Result<(), RegistryError> {
        let registration = self
            .default
            .as_mut()
            .ok_or(RegistryError::MissingDefaultHandler)?;
        if registration.fallback.is_some() {
            return Err(RegistryError::DuplicateDefaultFallback);
        }
        registration.fallback = Some(fallback);
        Ok(())
    }

    /// Resolve a persisted token. `None` on the record selects the default
    /// handler; an unknown token resolves to nothing.
    pub fn resolve(&self, handler_id: Option<&str>) -> Option<&Registration> {
        match handler_id {
            Some(id) => self.by_id.get(id),
            None => self.default.as_ref(),
        }
    }

    /// Number of token-registered handlers (excluding the default).
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty() && self.default.is_none()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handler_ids", &self.by_id.keys().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}
