//! Outbox record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::OutboxEventId;
use courier_events::MessageEnvelope;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Lifecycle status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Saved, never attempted by the processor
    Pending,
    /// Delivered to the broker
    Published,
    /// Last attempt failed; retry scheduled while `next_retry_at` is set
    Failed,
    /// Withdrawn before delivery
    Cancelled,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            "cancelled" => Ok(OutboxStatus::Cancelled),
            other => Err(format!("unknown outbox status '{other}'")),
        }
    }
}

/// A durable record of an event awaiting publication.
///
/// `event_data` holds the whole serialized envelope, so a replay publishes the same
/// `event_id` the producer assigned and consumers can deduplicate on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: OutboxEventId,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_data: JsonValue,
    pub routing_key: String,
    pub exchange: String,

    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub correlation_id: Option<String>,
    pub metadata: JsonValue,
}

impl OutboxEvent {
    /// Build a `Pending` record for `envelope`.
    pub fn from_envelope(
        envelope: &MessageEnvelope,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let now = Utc::now();
        Ok(Self {
            id: OutboxEventId::new(),
            aggregate_id: envelope.aggregate_id().to_owned(),
            aggregate_type: envelope.aggregate_type().to_owned(),
            event_type: envelope.event_type().to_owned(),
            event_data: serde_json::to_value(envelope)?,
            routing_key: routing_key.into(),
            exchange: exchange.into(),
            status: OutboxStatus::Pending,
            created_at: now,
            updated_at: now,
            published_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_retry_at: None,
            last_error: None,
            correlation_id: envelope.correlation_id().map(str::to_owned),
            metadata: JsonValue::Object(Default::default()),
        })
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Rebuild the envelope to publish.
    pub fn to_envelope(&self) -> Result<MessageEnvelope, serde_json::Error> {
        serde_json::from_value(self.event_data.clone())
    }

    /// `Failed` with no retry scheduled.
    pub fn is_terminal_failure(&self) -> bool {
        self.status == OutboxStatus::Failed && self.next_retry_at.is_none()
    }

    /// Whether the processor should pick this record up again at `now`.
    ///
    /// `retry_count` counts failed attempts, so a record scheduled after its last
    /// allowed retry (`retry_count == max_retries`) still gets that final attempt.
    pub fn is_retryable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Failed
            && self.retry_count <= self.max_retries
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Still eligible for delivery (pending or retry scheduled).
    pub fn is_deliverable(&self) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Failed => !self.is_terminal_failure(),
            OutboxStatus::Published | OutboxStatus::Cancelled => false,
        }
    }
}

/// Operational counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub published: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Sum of `retry_count` across all records.
    pub total_retries: u64,
}
