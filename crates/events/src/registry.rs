//! Explicit event-type → handler table.
//!
//! The table is built once at process start (each handler module registers itself
//! from an init routine) and then shared read-only, typically as
//! `Arc<HandlerRegistry>`. Lookup is by exact event type; wildcard routing is the
//! broker's job.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::handler::{EventHandler, MessageContext};
use crate::retry::RetryPolicy;

/// Predicate deciding whether a handler wants a given message.
pub type HandlerFilter = Arc<dyn Fn(&MessageContext) -> bool + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler '{handler_id}' is already registered for '{event_type}'")]
    DuplicateHandler {
        event_type: String,
        handler_id: String,
    },

    #[error("event type must not be empty")]
    EmptyEventType,
}

/// A registered handler and its per-handler policies.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub handler_id: String,
    pub priority: i32,
    pub handler: Arc<dyn EventHandler>,
    pub filter: Option<HandlerFilter>,
    pub retry_policy: Option<RetryPolicy>,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
}

impl HandlerDescriptor {
    pub fn new(handler_id: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
        Self::from_arc(handler_id, Arc::new(handler))
    }

    pub fn from_arc(handler_id: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            handler_id: handler_id.into(),
            priority: 0,
            handler,
            filter: None,
            retry_policy: None,
            circuit_breaker: None,
        }
    }

    /// Higher priorities run first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&MessageContext) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Guard the handler with its own breaker, named after the handler.
    pub fn with_circuit_breaker(self, config: CircuitBreakerConfig) -> Self {
        let breaker = CircuitBreaker::new(self.handler_id.clone(), config);
        self.with_breaker(Arc::new(breaker))
    }

    /// Guard the handler with an existing (possibly shared) breaker.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }
}

impl core::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("handler_id", &self.handler_id)
            .field("priority", &self.priority)
            .field("has_filter", &self.filter.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("circuit_breaker", &self.circuit_breaker.as_ref().map(|b| b.name()))
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<HandlerDescriptor>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `descriptor` for `event_type`.
    ///
    /// The list stays sorted by descending priority; equal priorities keep
    /// registration order.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        descriptor: HandlerDescriptor,
    ) -> Result<(), RegistryError> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(RegistryError::EmptyEventType);
        }

        let entries = self.handlers.entry(event_type.clone()).or_default();
        if entries.iter().any(|d| d.handler_id == descriptor.handler_id) {
            return Err(RegistryError::DuplicateHandler {
                event_type,
                handler_id: descriptor.handler_id,
            });
        }

        tracing::debug!(
            event_type = %event_type,
            handler_id = %descriptor.handler_id,
            priority = descriptor.priority,
            "handler registered"
        );
        entries.push(descriptor);
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(())
    }

    /// Handlers for `event_type`, highest priority first.
    pub fn handlers_for(&self, event_type: &str) -> &[HandlerDescriptor] {
        self.handlers.get(event_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_handlers(&self, event_type: &str) -> bool {
        !self.handlers_for(event_type).is_empty()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Every breaker guarding a registered handler.
    pub fn circuit_breakers(&self) -> impl Iterator<Item = &Arc<CircuitBreaker>> {
        self.handlers
            .values()
            .flatten()
            .filter_map(|d| d.circuit_breaker.as_ref())
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
