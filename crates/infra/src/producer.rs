//! Event producer.
//!
//! Publishing modes:
//! - **direct**: validate, declare the target exchange (once per channel) and publish a
//!   persistent JSON message carrying the envelope headers
//! - **outbox-backed** (when an [`OutboxStore`] is configured): save a `Pending` record,
//!   then try the direct path immediately; a failed attempt becomes a scheduled retry
//!   for the outbox processor and is reported as [`PublishOutcome::Deferred`]
//! - **batch**: [`EventProducer::publish_batch`] dispatches fixed-size chunks
//!   concurrently and reports per envelope
//! - **buffered**: [`BufferedPublisher`] accumulates envelopes and flushes them as a
//!   batch on size, on an interval or when the oldest entry has waited too long

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use courier_core::{EventId, OutboxEventId, SharedClock, SystemClock};
use courier_events::{Headers, MessageEnvelope, ValidationErrors};

use crate::broker::{BrokerChannel, BrokerError, ExchangeKind, ExchangeOptions, PublishProperties};
use crate::connection::ConnectionManager;
use crate::outbox::{EnvelopePublisher, OutboxEvent, OutboxStore, OutboxStoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    /// Reported as `sourceService` by envelopes this service creates.
    pub service_name: String,
    /// Exchange used when the caller does not name one.
    pub default_exchange: String,
    /// Envelopes dispatched concurrently by `publish_batch`.
    pub batch_chunk_size: usize,
    /// Delay before the outbox processor retries a failed immediate publish.
    pub outbox_retry_delay: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            service_name: "courier".to_owned(),
            default_exchange: "events".to_owned(),
            batch_chunk_size: 100,
            outbox_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Per-publish options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    /// Defaults to [`ProducerConfig::default_exchange`].
    pub exchange: Option<String>,
    /// Defaults to the envelope's event type.
    pub routing_key: Option<String>,
    /// Merged over the envelope headers.
    pub headers: Headers,
    /// Return the immediate publish error even when the outbox holds the event.
    pub propagate_errors: bool,
    /// Publish directly even when an outbox is configured.
    pub skip_outbox: bool,
    /// Overrides the outbox record's retry budget.
    pub max_retries: Option<u32>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn propagate_errors(mut self) -> Self {
        self.propagate_errors = true;
        self
    }

    pub fn skip_outbox(mut self) -> Self {
        self.skip_outbox = true;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Result of a successful `publish` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// The broker confirmed the message.
    Published { event_id: EventId },
    /// The outbox holds the event; the processor will deliver it.
    Deferred {
        event_id: EventId,
        outbox_id: OutboxEventId,
        reason: String,
    },
}

impl PublishOutcome {
    pub fn event_id(&self) -> EventId {
        match self {
            PublishOutcome::Published { event_id } | PublishOutcome::Deferred { event_id, .. } => {
                *event_id
            }
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Invalid(#[from] ValidationErrors),

    #[error("failed to serialize envelope: {0}")]
    Serialization(String),

    #[error(transparent)]
    Broker(BrokerError),

    #[error("publish rejected by broker: {0}")]
    Rejected(String),

    #[error(transparent)]
    Outbox(#[from] OutboxStoreError),
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishError::Invalid(_) | PublishError::Serialization(_) => false,
            PublishError::Broker(e) => e.is_retryable(),
            PublishError::Rejected(_) => true,
            PublishError::Outbox(e) => matches!(e, OutboxStoreError::Storage(_)),
        }
    }
}

impl From<BrokerError> for PublishError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Rejected(reason) => PublishError::Rejected(reason),
            other => PublishError::Broker(other),
        }
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(err: serde_json::Error) -> Self {
        PublishError::Serialization(err.to_string())
    }
}

/// Outcome of one envelope within a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub event_id: EventId,
    pub result: Result<PublishOutcome, PublishError>,
}

/// Per-envelope results, in submission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchItem> {
        self.items.iter().filter(|i| i.result.is_err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.items.iter().all(|i| i.result.is_ok())
    }
}

/// The producer's publish channel and the exchanges declared on it.
#[derive(Debug, Default)]
struct PublishChannel {
    channel: Option<Arc<dyn BrokerChannel>>,
    declared: HashSet<String>,
}

/// Publishes envelopes, optionally through a transactional outbox. Cheap to clone.
#[derive(Clone)]
pub struct EventProducer {
    connection: ConnectionManager,
    config: Arc<ProducerConfig>,
    outbox: Option<Arc<dyn OutboxStore>>,
    clock: SharedClock,
    publish: Arc<Mutex<PublishChannel>>,
}

impl std::fmt::Debug for EventProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProducer")
            .field("config", &self.config)
            .field("outbox", &self.outbox.is_some())
            .finish_non_exhaustive()
    }
}

impl EventProducer {
    pub fn new(connection: ConnectionManager, config: ProducerConfig) -> Self {
        Self {
            connection,
            config: Arc::new(config),
            outbox: None,
            clock: SystemClock::shared(),
            publish: Arc::new(Mutex::new(PublishChannel::default())),
        }
    }

    /// Route `publish` calls through `store`.
    pub fn with_outbox(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn outbox(&self) -> Option<&Arc<dyn OutboxStore>> {
        self.outbox.as_ref()
    }

    /// A new envelope stamped with this service's name.
    pub fn envelope(
        &self,
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        data: serde_json::Value,
    ) -> MessageEnvelope {
        MessageEnvelope::new(
            event_type,
            self.config.service_name.clone(),
            aggregate_type,
            aggregate_id,
            data,
        )
    }

    /// A `Pending` outbox record for `envelope`, for callers that save it inside
    /// their own database transaction (see `PostgresOutboxStore::save_in_tx`).
    pub fn outbox_record(
        &self,
        envelope: &MessageEnvelope,
        options: &PublishOptions,
    ) -> Result<OutboxEvent, PublishError> {
        ValidationErrors::check(envelope)?;
        let (exchange, routing_key) = self.target(envelope, options);
        let mut record = OutboxEvent::from_envelope(envelope, exchange, routing_key)?;
        if let Some(max_retries) = options.max_retries {
            record = record.with_max_retries(max_retries);
        }
        Ok(record)
    }

    fn target(&self, envelope: &MessageEnvelope, options: &PublishOptions) -> (String, String) {
        let exchange = options
            .exchange
            .clone()
            .unwrap_or_else(|| self.config.default_exchange.clone());
        let routing_key = options
            .routing_key
            .clone()
            .unwrap_or_else(|| envelope.event_type().to_owned());
        (exchange, routing_key)
    }

    /// Publish one envelope.
    ///
    /// With an outbox configured (and `skip_outbox` unset) the call succeeds once the
    /// record is saved, unless `propagate_errors` is set.
    #[instrument(
        skip(self, envelope, options),
        fields(event_id = %envelope.event_id(), event_type = %envelope.event_type()),
        err
    )]
    pub async fn publish(
        &self,
        envelope: &MessageEnvelope,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        ValidationErrors::check(envelope)?;

        match &self.outbox {
            Some(store) if !options.skip_outbox => {
                self.publish_via_outbox(store.as_ref(), envelope, options)
                    .await
            }
            _ => self.publish_direct(envelope, options).await,
        }
    }

    /// Publish straight to the broker, bypassing any outbox.
    pub async fn publish_direct(
        &self,
        envelope: &MessageEnvelope,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        ValidationErrors::check(envelope)?;
        let (exchange, routing_key) = self.target(envelope, options);
        self.send(envelope, &exchange, &routing_key, &options.headers)
            .await?;
        Ok(PublishOutcome::Published {
            event_id: envelope.event_id(),
        })
    }

    async fn publish_via_outbox(
        &self,
        store: &dyn OutboxStore,
        envelope: &MessageEnvelope,
        options: &PublishOptions,
    ) -> Result<PublishOutcome, PublishError> {
        let record = self.outbox_record(envelope, options)?;
        let outbox_id = store.save(record.clone()).await?;

        let err = match self
            .send(envelope, &record.exchange, &record.routing_key, &options.headers)
            .await
        {
            Ok(()) => {
                // The processor may have delivered it first; either way it is out.
                if let Err(e) = store.mark_published(outbox_id, self.clock.now()).await {
                    debug!(outbox_id = %outbox_id, error = %e, "could not mark outbox event published");
                }
                return Ok(PublishOutcome::Published {
                    event_id: envelope.event_id(),
                });
            }
            Err(err) => err,
        };

        let reason = err.to_string();
        let recorded = if err.is_retryable() && record.max_retries > 0 {
            let delay = chrono::Duration::from_std(self.config.outbox_retry_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(1));
            store
                .mark_retry(outbox_id, self.clock.now() + delay, &reason)
                .await
        } else {
            store.mark_failed(outbox_id, &reason).await
        };
        if let Err(e) = recorded {
            debug!(outbox_id = %outbox_id, error = %e, "could not record failed publish");
        }

        if options.propagate_errors {
            return Err(err);
        }
        warn!(outbox_id = %outbox_id, error = %reason, "immediate publish failed; deferred to outbox");
        Ok(PublishOutcome::Deferred {
            event_id: envelope.event_id(),
            outbox_id,
            reason,
        })
    }

    /// Publish many envelopes with the same options.
    ///
    /// Envelopes go out in chunks of `batch_chunk_size`; within a chunk they are
    /// dispatched concurrently. Results come back in submission order.
    pub async fn publish_batch(
        &self,
        envelopes: Vec<MessageEnvelope>,
        options: &PublishOptions,
    ) -> BatchReport {
        let items = envelopes
            .into_iter()
            .map(|envelope| (envelope, options.clone()))
            .collect();
        self.publish_all(items).await
    }

    async fn publish_all(&self, items: Vec<(MessageEnvelope, PublishOptions)>) -> BatchReport {
        let chunk_size = self.config.batch_chunk_size.max(1);
        let mut report = BatchReport::default();
        let mut items = items.into_iter().peekable();

        while items.peek().is_some() {
            let chunk: Vec<_> = items.by_ref().take(chunk_size).collect();
            let handles: Vec<(EventId, JoinHandle<_>)> = chunk
                .into_iter()
                .map(|(envelope, options)| {
                    let producer = self.clone();
                    let event_id = envelope.event_id();
                    let handle =
                        tokio::spawn(async move { producer.publish(&envelope, &options).await });
                    (event_id, handle)
                })
                .collect();

            for (event_id, handle) in handles {
                let result = handle.await.unwrap_or_else(|e| {
                    Err(PublishError::Broker(BrokerError::Channel(format!(
                        "publish task failed: {e}"
                    ))))
                });
                report.items.push(BatchItem { event_id, result });
            }
        }

        let failed = report.len() - report.succeeded();
        if failed > 0 {
            warn!(total = report.len(), failed, "batch publish finished with failures");
        }
        report
    }

    /// Direct path: declare the exchange if needed and publish.
    async fn send(
        &self,
        envelope: &MessageEnvelope,
        exchange: &str,
        routing_key: &str,
        overrides: &Headers,
    ) -> Result<(), PublishError> {
        let body = envelope.to_json_bytes()?;
        let mut headers = envelope.headers();
        headers.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        let priority = envelope.metadata().priority;
        let properties = PublishProperties {
            message_id: Some(envelope.event_id().to_string()),
            priority: (priority > 0).then_some(priority),
            headers,
            ..PublishProperties::persistent_json()
        };

        let mut publish = self.publish.lock().await;
        let channel = match publish.channel.as_ref().filter(|c| c.is_open()) {
            Some(channel) => channel.clone(),
            None => {
                let channel = self.connection.channel().await?;
                publish.channel = Some(channel.clone());
                publish.declared.clear();
                channel
            }
        };

        if !exchange.is_empty() && !publish.declared.contains(exchange) {
            if let Err(e) = channel
                .declare_exchange(exchange, ExchangeKind::Topic, ExchangeOptions::durable())
                .await
            {
                self.drop_channel(&mut publish, &channel).await;
                return Err(e.into());
            }
            publish.declared.insert(exchange.to_owned());
        }

        match channel
            .basic_publish(exchange, routing_key, &body, &properties)
            .await
        {
            Ok(()) => {
                debug!(
                    event_id = %envelope.event_id(),
                    exchange,
                    routing_key,
                    "event published"
                );
                Ok(())
            }
            Err(BrokerError::Rejected(reason)) => Err(PublishError::Rejected(reason)),
            Err(e) => {
                self.drop_channel(&mut publish, &channel).await;
                Err(e.into())
            }
        }
    }

    async fn drop_channel(&self, publish: &mut PublishChannel, channel: &Arc<dyn BrokerChannel>) {
        publish.channel = None;
        publish.declared.clear();
        self.connection.discard_channel(channel).await;
    }
}

#[async_trait]
impl EnvelopePublisher for EventProducer {
    async fn publish_envelope(
        &self,
        envelope: &MessageEnvelope,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        self.send(envelope, exchange, routing_key, &Headers::new())
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferConfig {
    /// Flush as soon as this many envelopes are buffered.
    pub batch_size: usize,
    /// Periodic flush. Values below one millisecond are raised to it.
    pub flush_interval: Duration,
    /// Upper bound on how long any envelope sits in the buffer.
    pub max_wait: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(5),
        }
    }
}

/// `tokio::time::interval` rejects a zero period.
const MIN_TICK: Duration = Duration::from_millis(1);

enum Command {
    Publish(MessageEnvelope, PublishOptions),
    Flush(oneshot::Sender<BatchReport>),
    Close(oneshot::Sender<BatchReport>),
}

/// Buffers envelopes and publishes them in batches from a background task.
///
/// Background flushes only log failures; call [`flush`](Self::flush) or
/// [`close`](Self::close) to get a report.
#[derive(Debug)]
pub struct BufferedPublisher {
    tx: mpsc::Sender<Command>,
    join: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BufferedPublisher {
    pub fn new(producer: EventProducer, config: BufferConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.batch_size.max(1) * 2);
        let join = tokio::spawn(buffer_loop(producer, config, rx));
        Self {
            tx,
            join: std::sync::Mutex::new(Some(join)),
        }
    }

    /// Validate and buffer an envelope.
    pub async fn publish(
        &self,
        envelope: MessageEnvelope,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        ValidationErrors::check(&envelope)?;
        self.tx
            .send(Command::Publish(envelope, options))
            .await
            .map_err(|_| PublishError::Broker(BrokerError::Closed))
    }

    /// Publish everything buffered so far.
    pub async fn flush(&self) -> Result<BatchReport, PublishError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| PublishError::Broker(BrokerError::Closed))?;
        rx.await
            .map_err(|_| PublishError::Broker(BrokerError::Closed))
    }

    /// Flush and stop the background task. Later calls return an empty report.
    pub async fn close(&self) -> BatchReport {
        let (reply, rx) = oneshot::channel();
        let report = if self.tx.send(Command::Close(reply)).await.is_ok() {
            rx.await.unwrap_or_default()
        } else {
            BatchReport::default()
        };

        let join = self.join.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(join) = join {
            let _ = join.await;
        }
        report
    }
}

async fn buffer_loop(
    producer: EventProducer,
    config: BufferConfig,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut buffer: Vec<(MessageEnvelope, PublishOptions)> = Vec::new();
    let mut oldest: Option<Instant> = None;
    let mut ticker = tokio::time::interval(config.flush_interval.max(MIN_TICK));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let deadline = oldest.map(|at| at + config.max_wait);
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Publish(envelope, options)) => {
                    oldest.get_or_insert_with(Instant::now);
                    buffer.push((envelope, options));
                    if buffer.len() >= config.batch_size {
                        flush(&producer, &mut buffer, &mut oldest).await;
                    }
                }
                Some(Command::Flush(reply)) => {
                    let _ = reply.send(flush(&producer, &mut buffer, &mut oldest).await);
                }
                Some(Command::Close(reply)) => {
                    let _ = reply.send(flush(&producer, &mut buffer, &mut oldest).await);
                    break;
                }
                None => {
                    flush(&producer, &mut buffer, &mut oldest).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(&producer, &mut buffer, &mut oldest).await;
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                flush(&producer, &mut buffer, &mut oldest).await;
            }
        }
    }
    debug!("buffered publisher stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn flush(
    producer: &EventProducer,
    buffer: &mut Vec<(MessageEnvelope, PublishOptions)>,
    oldest: &mut Option<Instant>,
) -> BatchReport {
    *oldest = None;
    if buffer.is_empty() {
        return BatchReport::default();
    }
    let items = std::mem::take(buffer);
    debug!(count = items.len(), "flushing buffered events");
    producer.publish_all(items).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use courier_events::header;

    use crate::broker::{InMemoryBroker, QueueOptions};
    use crate::connection::ConnectionConfig;
    use crate::outbox::{InMemoryOutboxStore, OutboxStatus};

    fn setup() -> (InMemoryBroker, ConnectionManager) {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionConfig {
                reconnect_delay: Duration::from_millis(1),
                max_reconnect_attempts: 1,
            },
        );
        (broker, manager)
    }

    /// Queue receiving everything published to `exchange`.
    async fn tap(manager: &ConnectionManager, exchange: &str, queue: &str) {
        let channel = manager.channel().await.unwrap();
        channel
            .declare_exchange(exchange, ExchangeKind::Topic, ExchangeOptions::durable())
            .await
            .unwrap();
        channel
            .declare_queue(queue, QueueOptions::durable())
            .await
            .unwrap();
        channel.bind_queue(queue, exchange, "#").await.unwrap();
    }

    fn envelope(event_type: &str) -> MessageEnvelope {
        MessageEnvelope::new(event_type, "orders", "Order", "o-1", json!({ "total": 42 }))
    }

    #[tokio::test]
    async fn direct_publish_carries_headers_and_properties() {
        let (broker, manager) = setup();
        tap(&manager, "events", "tap").await;
        let producer = EventProducer::new(manager, ProducerConfig::default());
        let envelope = envelope("order.placed")
            .with_correlation("req-1")
            .with_priority(5);

        let outcome = producer
            .publish(
                &envelope,
                &PublishOptions::new().header(header::SOURCE_SERVICE, "override"),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PublishOutcome::Published {
                event_id: envelope.event_id()
            }
        );

        let messages = broker.ready_messages("tap");
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.routing_key, "order.placed");
        assert!(message.properties.persistent);
        assert_eq!(message.properties.priority, Some(5));
        assert_eq!(
            message.properties.message_id,
            Some(envelope.event_id().to_string())
        );
        let headers = &message.properties.headers;
        assert_eq!(headers[header::CORRELATION_ID], json!("req-1"));
        assert_eq!(headers[header::SOURCE_SERVICE], json!("override"));
        assert_eq!(headers[header::RETRY_COUNT], json!(0));
        assert_eq!(
            MessageEnvelope::from_json_slice(&message.body).unwrap(),
            envelope
        );
        assert_eq!(broker.exchange_kind("events"), Some(ExchangeKind::Topic));
    }

    #[tokio::test]
    async fn invalid_envelopes_never_reach_the_broker() {
        let (broker, manager) = setup();
        let store = InMemoryOutboxStore::arc();
        let producer =
            EventProducer::new(manager, ProducerConfig::default()).with_outbox(store.clone());

        let err = producer
            .publish(&envelope(""), &PublishOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Invalid(_)));
        assert!(!err.is_retryable());
        assert_eq!(broker.published_count(), 0);
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn outbox_backed_publish_marks_record_published() {
        let (_broker, manager) = setup();
        let store = InMemoryOutboxStore::arc();
        let producer =
            EventProducer::new(manager, ProducerConfig::default()).with_outbox(store.clone());

        let outcome = producer
            .publish(&envelope("order.placed"), &PublishOptions::new())
            .await
            .unwrap();

        assert!(outcome.is_published());
        let records = store.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, OutboxStatus::Published);
        assert!(records[0].published_at.is_some());
    }

    #[tokio::test]
    async fn outbox_backed_publish_defers_when_broker_is_down() {
        let (broker, manager) = setup();
        broker.set_available(false);
        let store = InMemoryOutboxStore::arc();
        let producer =
            EventProducer::new(manager, ProducerConfig::default()).with_outbox(store.clone());
        let envelope = envelope("order.placed");

        let outcome = producer
            .publish(&envelope, &PublishOptions::new())
            .await
            .unwrap();

        let PublishOutcome::Deferred { outbox_id, .. } = outcome else {
            panic!("expected a deferred outcome, got {outcome:?}");
        };
        let record = store.get(outbox_id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.next_retry_at.is_some());
        assert_eq!(record.to_envelope().unwrap().event_id(), envelope.event_id());

        let err = producer
            .publish(&envelope.with_event_id(EventId::new()), &PublishOptions::new().propagate_errors())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.all().len(), 2);
    }

    #[tokio::test]
    async fn broker_rejections_are_retryable() {
        let (broker, manager) = setup();
        let producer = EventProducer::new(manager, ProducerConfig::default());
        broker.reject_next_publishes(1);

        let err = producer
            .publish(&envelope("order.placed"), &PublishOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Rejected(_)));
        assert!(err.is_retryable());

        // Same channel keeps working.
        producer
            .publish(&envelope("order.placed"), &PublishOptions::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn topology_conflicts_discard_the_channel() {
        let (_broker, manager) = setup();
        let channel = manager.channel().await.unwrap();
        channel
            .declare_exchange("legacy", ExchangeKind::Fanout, ExchangeOptions::durable())
            .await
            .unwrap();
        let producer = EventProducer::new(manager.clone(), ProducerConfig::default());

        let err = producer
            .publish(&envelope("a.b"), &PublishOptions::new().exchange("legacy"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Broker(BrokerError::Topology(_))));
        assert!(!err.is_retryable());

        producer
            .publish(&envelope("a.b"), &PublishOptions::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn batch_results_keep_submission_order() {
        let (broker, manager) = setup();
        tap(&manager, "events", "tap").await;
        let producer = EventProducer::new(
            manager,
            ProducerConfig {
                batch_chunk_size: 2,
                ..Default::default()
            },
        );
        let envelopes = vec![
            envelope("a.one"),
            envelope(""),
            envelope("a.three"),
            envelope("a.four"),
            envelope("a.five"),
        ];
        let ids: Vec<_> = envelopes.iter().map(MessageEnvelope::event_id).collect();

        let report = producer
            .publish_batch(envelopes, &PublishOptions::new())
            .await;

        assert_eq!(report.len(), 5);
        assert_eq!(
            report.items.iter().map(|i| i.event_id).collect::<Vec<_>>(),
            ids
        );
        assert_eq!(report.succeeded(), 4);
        assert!(matches!(
            report.items[1].result,
            Err(PublishError::Invalid(_))
        ));
        assert_eq!(broker.queue_depth("tap"), 4);
    }

    #[tokio::test]
    async fn buffered_publisher_flushes_on_size_and_on_demand() {
        let (broker, manager) = setup();
        tap(&manager, "events", "tap").await;
        let producer = EventProducer::new(manager, ProducerConfig::default());
        let buffered = BufferedPublisher::new(
            producer,
            BufferConfig {
                batch_size: 3,
                flush_interval: Duration::from_secs(3600),
                max_wait: Duration::from_secs(3600),
            },
        );

        for i in 0..4 {
            buffered
                .publish(envelope(&format!("a.e{i}")), PublishOptions::new())
                .await
                .unwrap();
        }
        // The explicit flush is queued behind the size-triggered one.
        let report = buffered.flush().await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(broker.queue_depth("tap"), 4);

        buffered
            .publish(envelope("a.last"), PublishOptions::new())
            .await
            .unwrap();
        let report = buffered.close().await;
        assert_eq!(report.succeeded(), 1);
        assert_eq!(broker.queue_depth("tap"), 5);

        assert!(buffered.publish(envelope("a.late"), PublishOptions::new()).await.is_err());
        assert!(buffered.close().await.is_empty());
    }

    #[tokio::test]
    async fn buffered_publisher_survives_zero_flush_interval() {
        let (broker, manager) = setup();
        tap(&manager, "events", "tap").await;
        let producer = EventProducer::new(manager, ProducerConfig::default());
        let buffered = BufferedPublisher::new(
            producer,
            BufferConfig {
                batch_size: 100,
                flush_interval: Duration::ZERO,
                max_wait: Duration::from_secs(3600),
            },
        );

        buffered
            .publish(envelope("a.b"), PublishOptions::new())
            .await
            .unwrap();
        for _ in 0..100 {
            if broker.queue_depth("tap") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.queue_depth("tap"), 1);
        buffered
            .publish(envelope("a.c"), PublishOptions::new())
            .await
            .unwrap();
        buffered.close().await;
        assert_eq!(broker.queue_depth("tap"), 2);
    }

    #[tokio::test]
    async fn buffered_publisher_honours_max_wait() {
        let (broker, manager) = setup();
        tap(&manager, "events", "tap").await;
        let producer = EventProducer::new(manager, ProducerConfig::default());
        let buffered = BufferedPublisher::new(
            producer,
            BufferConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(3600),
                max_wait: Duration::from_millis(20),
            },
        );

        buffered
            .publish(envelope("a.b"), PublishOptions::new())
            .await
            .unwrap();
        for _ in 0..100 {
            if broker.queue_depth("tap") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(broker.queue_depth("tap"), 1);

        buffered
            .publish(envelope(""), PublishOptions::new())
            .await
            .unwrap_err();
        buffered.close().await;
    }
}
