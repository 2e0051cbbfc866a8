//! Message envelopes, handler dispatch and failure isolation (mechanics only).
//!
//! Nothing in this crate talks to a broker or a database; `courier-infra` wires these
//! pieces to transports and storage.

pub mod circuit_breaker;
pub mod envelope;
pub mod executor;
pub mod handler;
pub mod registry;
pub mod retry;
pub mod topic;
pub mod validation;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerState, CircuitState,
    ExpectedError,
};
pub use envelope::{EnvelopeMetadata, Headers, MessageEnvelope, header};
pub use executor::{ExecutionReport, ExecutionResult, HandlerExecutor};
pub use handler::{EventHandler, HandlerFn, MessageContext, handler_fn};
pub use registry::{HandlerDescriptor, HandlerFilter, HandlerRegistry, RegistryError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use validation::{ValidationErrors, Violation, validate};
