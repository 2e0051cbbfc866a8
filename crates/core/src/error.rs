//! Handler error model.

use serde::Serialize;
use thiserror::Error;

/// Result type returned by event handlers.
pub type HandlerResult<T = ()> = Result<T, HandlerError>;

/// Message fragments that mark a free-form failure as a business rejection.
const NON_RETRYABLE_MARKERS: [&str; 3] = ["validation", "authori", "forbidden"];

/// Failure reported by an event handler.
///
/// Handlers run under at-least-once delivery, so the variant decides what the
/// consumer does next:
///
/// - **Rejections** (`Validation`, `Unauthorized`, `Forbidden`) will fail the same way on
///   every redelivery. They are never retried and never counted against a circuit breaker.
/// - **Everything else** is treated as transient and retried with backoff until the
///   subscription's retry budget is spent.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum HandlerError {
    /// The payload failed business validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The event's actor is not authenticated for this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The event's actor is authenticated but not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A resource the handler depends on does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// The handler did not finish in time.
    #[error("handler timed out after {0} ms")]
    Timeout(u64),

    /// The handler's circuit breaker rejected the call without invoking it.
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    /// Any other failure (dependency down, I/O error, bug).
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Whether redelivering the message could produce a different outcome.
    ///
    /// Free-form `Failed` errors are classified by their message, so wrapped errors
    /// from lower layers ("Forbidden: quota exceeded") are still rejected fast.
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Validation(_)
            | HandlerError::Unauthorized(_)
            | HandlerError::Forbidden(_) => false,
            HandlerError::Failed(msg) => {
                let msg = msg.to_ascii_lowercase();
                !NON_RETRYABLE_MARKERS.iter().any(|m| msg.contains(m))
            }
            HandlerError::NotFound(_)
            | HandlerError::Timeout(_)
            | HandlerError::CircuitOpen(_) => true,
        }
    }

    /// Whether the error is an expected business outcome rather than a fault.
    ///
    /// Expected errors pass through circuit breakers without affecting their state.
    pub fn is_expected(&self) -> bool {
        !self.is_retryable()
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Validation(format!("payload does not match schema: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_not_retryable() {
        assert!(!HandlerError::validation("missing email").is_retryable());
        assert!(!HandlerError::unauthorized("no token").is_retryable());
        assert!(!HandlerError::forbidden("wrong tenant").is_retryable());
    }

    #[test]
    fn free_form_failures_are_classified_by_message() {
        assert!(!HandlerError::failed("Validation error: name too long").is_retryable());
        assert!(!HandlerError::failed("upstream said FORBIDDEN").is_retryable());
        assert!(!HandlerError::failed("Unauthorized: token expired").is_retryable());
        assert!(!HandlerError::failed("authorization denied for tenant t-9").is_retryable());
        assert!(HandlerError::failed("authorization denied for tenant t-9").is_expected());
        assert!(HandlerError::failed("connection reset by peer").is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable_and_unexpected() {
        for err in [
            HandlerError::Timeout(500),
            HandlerError::not_found("user 42"),
            HandlerError::CircuitOpen("billing".into()),
        ] {
            assert!(err.is_retryable(), "{err}");
            assert!(!err.is_expected(), "{err}");
        }
    }

    #[test]
    fn serde_errors_map_to_validation() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        assert!(matches!(HandlerError::from(err), HandlerError::Validation(_)));
    }
}
