//! Envelope validation.
//!
//! Validation is a pure function over an envelope; the producer calls it explicitly
//! before anything is written to the outbox or the broker.

use crate::envelope::MessageEnvelope;

const MAX_EVENT_TYPE_LEN: usize = 255;
const MAX_PRIORITY: u8 = 9;

/// A single rule an envelope breaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

impl Violation {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for Violation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Non-empty list of violations, usable as an error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid envelope: {}", join(.0))]
pub struct ValidationErrors(pub Vec<Violation>);

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    /// `Ok(())` when `envelope` has no violations.
    pub fn check(envelope: &MessageEnvelope) -> Result<(), ValidationErrors> {
        let violations = validate(envelope);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors(violations))
        }
    }
}

/// Return every rule `envelope` breaks (empty when valid).
pub fn validate(envelope: &MessageEnvelope) -> Vec<Violation> {
    let mut violations = Vec::new();

    let event_type = envelope.event_type();
    if event_type.trim().is_empty() {
        violations.push(Violation::new("eventType", "must not be empty"));
    } else if event_type.len() > MAX_EVENT_TYPE_LEN {
        violations.push(Violation::new(
            "eventType",
            format!("must be at most {MAX_EVENT_TYPE_LEN} characters"),
        ));
    } else if event_type.chars().any(char::is_whitespace) {
        violations.push(Violation::new("eventType", "must not contain whitespace"));
    } else if event_type.split('.').any(str::is_empty) {
        violations.push(Violation::new("eventType", "must not contain empty segments"));
    }

    if envelope.event_version() == 0 {
        violations.push(Violation::new("eventVersion", "must be at least 1"));
    }
    if envelope.source_service().trim().is_empty() {
        violations.push(Violation::new("sourceService", "must not be empty"));
    }
    if envelope.aggregate_id().trim().is_empty() {
        violations.push(Violation::new("aggregateId", "must not be empty"));
    }
    if envelope.aggregate_type().trim().is_empty() {
        violations.push(Violation::new("aggregateType", "must not be empty"));
    }

    let metadata = envelope.metadata();
    if metadata.priority > MAX_PRIORITY {
        violations.push(Violation::new(
            "metadata.priority",
            format!("must be between 0 and {MAX_PRIORITY}"),
        ));
    }
    if metadata
        .correlation_id
        .as_deref()
        .is_some_and(|c| c.trim().is_empty())
    {
        violations.push(Violation::new("metadata.correlationId", "must not be blank when set"));
    }
    if let Some(expires_at) = metadata.expires_at {
        if expires_at <= envelope.event_timestamp() {
            violations.push(Violation::new(
                "metadata.expiresAt",
                "must be after eventTimestamp",
            ));
        }
        if metadata.delay_until.is_some_and(|d| d >= expires_at) {
            violations.push(Violation::new(
                "metadata.delayUntil",
                "must be before expiresAt",
            ));
        }
    }

    violations
}
