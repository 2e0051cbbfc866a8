use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, warn};

use courier_core::HandlerError;

use crate::circuit_breaker::CircuitState;
use crate::handler::MessageContext;
use crate::registry::{HandlerDescriptor, HandlerRegistry};
use crate::retry::RetryPolicy;

/// Outcome of one handler for one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub handler_id: String,
    pub success: bool,
    /// The handler's filter declined the message (counts as success).
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerError>,
    pub duration_ms: u64,
    pub retry_count_at_invocation: u32,
}

/// All handler outcomes for one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub results: Vec<ExecutionResult>,
    /// Breaker that stopped the chain, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_by: Option<String>,
    /// Most restrictive retry policy among the handlers that failed.
    #[serde(skip)]
    pub retry_policy: Option<RetryPolicy>,
}

impl ExecutionReport {
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// Whether any failure is a rejection that redelivery cannot fix.
    pub fn has_non_retryable_failure(&self) -> bool {
        self.failures()
            .filter_map(|r| r.error.as_ref())
            .any(|e| !e.is_retryable())
    }

    /// First failure, for logging and dead-letter diagnostics.
    pub fn first_error(&self) -> Option<&HandlerError> {
        self.failures().find_map(|r| r.error.as_ref())
    }
}

/// Runs the registered handlers for a message in priority order.
#[derive(Debug, Clone)]
pub struct HandlerExecutor {
    registry: Arc<HandlerRegistry>,
}

impl HandlerExecutor {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub async fn execute_handlers(&self, ctx: &MessageContext) -> ExecutionReport {
        let descriptors = self.registry.handlers_for(ctx.event_type());
        let mut report = ExecutionReport::default();

        if descriptors.is_empty() {
            debug!(
                event_type = %ctx.event_type(),
                event_id = %ctx.envelope.event_id(),
                "no handlers registered"
            );
            return report;
        }

        for descriptor in descriptors {
            let result = run_one(descriptor, ctx).await;

            if !result.success {
                if let Some(policy) = &descriptor.retry_policy {
                    let stricter = report
                        .retry_policy
                        .as_ref()
                        .is_none_or(|current| policy.max_attempts < current.max_attempts);
                    if stricter {
                        report.retry_policy = Some(policy.clone());
                    }
                }
            }

            let halt = !result.success
                && descriptor
                    .circuit_breaker
                    .as_ref()
                    .is_some_and(|b| b.state() == CircuitState::Open);
            report.results.push(result);

            if halt {
                warn!(
                    handler_id = %descriptor.handler_id,
                    event_id = %ctx.envelope.event_id(),
                    "circuit open, skipping remaining handlers"
                );
                report.halted_by = Some(descriptor.handler_id.clone());
                break;
            }
        }

        report
    }
}

async fn run_one(descriptor: &HandlerDescriptor, ctx: &MessageContext) -> ExecutionResult {
    let started = Instant::now();

    if let Some(filter) = &descriptor.filter {
        if !filter(ctx) {
            return ExecutionResult {
                handler_id: descriptor.handler_id.clone(),
                success: true,
                skipped: true,
                error: None,
                duration_ms: 0,
                retry_count_at_invocation: ctx.retry_count,
            };
        }
    }

    let outcome = match &descriptor.circuit_breaker {
        Some(breaker) => breaker
            .execute(|| descriptor.handler.handle(ctx))
            .await
            .map_err(HandlerError::from),
        None => descriptor.handler.handle(ctx).await,
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match &outcome {
        Ok(()) => debug!(
            handler_id = %descriptor.handler_id,
            event_id = %ctx.envelope.event_id(),
            duration_ms,
            "handler succeeded"
        ),
        Err(error) => warn!(
            handler_id = %descriptor.handler_id,
            event_id = %ctx.envelope.event_id(),
            retry_count = ctx.retry_count,
            duration_ms,
            error = %error,
            "handler failed"
        ),
    }

    ExecutionResult {
        handler_id: descriptor.handler_id.clone(),
        success: outcome.is_ok(),
        skipped: false,
        error: outcome.err(),
        duration_ms,
        retry_count_at_invocation: ctx.retry_count,
    }
}
