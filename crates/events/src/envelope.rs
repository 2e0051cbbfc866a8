use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::EventId;

/// Message headers as exchanged with the broker.
pub type Headers = BTreeMap<String, JsonValue>;

/// Header names of the producer → consumer contract.
pub mod header {
    pub const MESSAGE_ID: &str = "messageId";
    pub const MESSAGE_TYPE: &str = "messageType";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SOURCE_SERVICE: &str = "sourceService";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const CAUSATION_ID: &str = "causationId";
    pub const RETRY_COUNT: &str = "retryCount";
    pub const EVENT_VERSION: &str = "eventVersion";
}

/// Delivery metadata carried alongside the payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// How many times the consumer side has already retried this event.
    #[serde(default)]
    pub retry_count: u32,
    /// Broker priority (0-9, higher first).
    #[serde(default)]
    pub priority: u8,
    /// Do not process before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    /// Drop instead of processing after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Wire-level unit exchanged over the broker.
///
/// Envelopes are immutable values: every `with_*` method returns a new envelope and
/// leaves the receiver untouched, so a retried or correlated copy can never alias the
/// message a handler is still looking at.
///
/// `event_id` is stable across redeliveries and outbox replays; handlers use it as
/// their idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    event_id: EventId,
    event_type: String,
    event_version: u32,
    event_timestamp: DateTime<Utc>,

    source_service: String,
    aggregate_id: String,
    aggregate_type: String,

    #[serde(default)]
    metadata: EnvelopeMetadata,

    data: JsonValue,
}

impl MessageEnvelope {
    /// Create a version-1 envelope stamped with a fresh id and the current time.
    pub fn new(
        event_type: impl Into<String>,
        source_service: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        data: JsonValue,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            event_version: 1,
            event_timestamp: Utc::now(),
            source_service: source_service.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            metadata: EnvelopeMetadata::default(),
            data,
        }
    }

    /// Serialize a typed payload into a new envelope.
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        source_service: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_value(payload)?;
        Ok(Self::new(event_type, source_service, aggregate_type, aggregate_id, data))
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn event_timestamp(&self) -> DateTime<Utc> {
        self.event_timestamp
    }

    pub fn source_service(&self) -> &str {
        &self.source_service
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.correlation_id.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.metadata.retry_count
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    /// Deserialize the payload into a typed event.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    pub fn into_data(self) -> JsonValue {
        self.data
    }

    pub fn with_event_id(&self, event_id: EventId) -> Self {
        Self {
            event_id,
            ..self.clone()
        }
    }

    pub fn with_version(&self, event_version: u32) -> Self {
        Self {
            event_version,
            ..self.clone()
        }
    }

    pub fn with_timestamp(&self, event_timestamp: DateTime<Utc>) -> Self {
        Self {
            event_timestamp,
            ..self.clone()
        }
    }

    pub fn with_correlation(&self, correlation_id: impl Into<String>) -> Self {
        self.with_metadata(|m| m.correlation_id = Some(correlation_id.into()))
    }

    pub fn with_causation(&self, causation_id: impl Into<String>) -> Self {
        self.with_metadata(|m| m.causation_id = Some(causation_id.into()))
    }

    /// Copy of this envelope marking one more consumer-side retry.
    pub fn with_retry(&self) -> Self {
        self.with_metadata(|m| m.retry_count = m.retry_count.saturating_add(1))
    }

    pub fn with_delay(&self, delay_until: DateTime<Utc>) -> Self {
        self.with_metadata(|m| m.delay_until = Some(delay_until))
    }

    pub fn with_priority(&self, priority: u8) -> Self {
        self.with_metadata(|m| m.priority = priority)
    }

    pub fn with_expiry(&self, expires_at: DateTime<Utc>) -> Self {
        self.with_metadata(|m| m.expires_at = Some(expires_at))
    }

    /// Link this envelope to the event that caused it.
    ///
    /// The correlation id is inherited from the parent (or seeded with the parent's
    /// event id), and the causation id points at the parent.
    pub fn caused_by(&self, parent: &MessageEnvelope) -> Self {
        let correlation = parent
            .correlation_id()
            .map(str::to_owned)
            .unwrap_or_else(|| parent.event_id.to_string());
        self.with_metadata(|m| {
            m.correlation_id = Some(correlation);
            m.causation_id = Some(parent.event_id.to_string());
        })
    }

    fn with_metadata(&self, f: impl FnOnce(&mut EnvelopeMetadata)) -> Self {
        let mut metadata = self.metadata.clone();
        f(&mut metadata);
        Self {
            metadata,
            ..self.clone()
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.metadata.expires_at.is_some_and(|at| now >= at)
    }

    /// Whether a delayed envelope may be processed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.metadata.delay_until.is_none_or(|at| now >= at)
    }

    /// Headers of the producer → consumer contract.
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(header::MESSAGE_ID.into(), self.event_id.to_string().into());
        headers.insert(header::MESSAGE_TYPE.into(), self.event_type.clone().into());
        headers.insert(header::TIMESTAMP.into(), self.event_timestamp.to_rfc3339().into());
        headers.insert(header::SOURCE_SERVICE.into(), self.source_service.clone().into());
        headers.insert(header::EVENT_VERSION.into(), self.event_version.into());
        headers.insert(header::RETRY_COUNT.into(), self.metadata.retry_count.into());
        if let Some(correlation_id) = &self.metadata.correlation_id {
            headers.insert(header::CORRELATION_ID.into(), correlation_id.clone().into());
        }
        if let Some(causation_id) = &self.metadata.causation_id {
            headers.insert(header::CAUSATION_ID.into(), causation_id.clone().into());
        }
        headers
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
