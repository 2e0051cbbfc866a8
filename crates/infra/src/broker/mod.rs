//! Broker seam.
//!
//! The rest of the crate talks to an AMQP-style broker only through these traits:
//! [`Broker`] establishes connections, a [`BrokerConnection`] opens channels and a
//! [`BrokerChannel`] declares topology, publishes, consumes and settles deliveries.
//!
//! Implementations:
//! - [`memory::InMemoryBroker`]: process-local broker for tests and local development
//! - `amqp::AmqpBroker` (feature `amqp`): RabbitMQ via `lapin`

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use courier_events::Headers;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

pub use memory::InMemoryBroker;

/// Argument/header table passed to the broker.
pub type FieldTable = Headers;

/// Queue argument naming the dead-letter exchange.
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument overriding the routing key used when dead-lettering.
pub const ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument enabling message priorities up to the given value.
pub const ARG_MAX_PRIORITY: &str = "x-max-priority";

/// Broker/transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Connection-level failure (broker unreachable, heartbeat loss, forced close).
    #[error("broker connection error: {0}")]
    Connection(String),

    /// Channel-level failure; the channel is unusable but the connection is fine.
    #[error("broker channel error: {0}")]
    Channel(String),

    /// The broker refused a publish (negative confirm, buffer full).
    #[error("publish rejected by broker: {0}")]
    Rejected(String),

    /// Topology declaration conflicts with what already exists.
    #[error("topology error: {0}")]
    Topology(String),

    /// The channel or connection was already closed.
    #[error("channel or connection closed")]
    Closed,
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BrokerError::Topology(_))
    }

    /// Whether the error invalidates the whole connection, not just a channel.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    pub fn with_argument(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    /// Deliveries count as acknowledged as soon as they are sent.
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Per-message properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    /// Delivery mode 2 (survives broker restarts on durable queues).
    pub persistent: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    pub headers: FieldTable,
}

impl PublishProperties {
    pub fn persistent_json() -> Self {
        Self {
            persistent: true,
            content_type: Some("application/json".to_owned()),
            ..Default::default()
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel-scoped tag used to ack/nack.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
}

/// Deliveries for one `basic_consume`. Ends when the consumer is cancelled or its
/// channel closes.
#[derive(Debug)]
pub struct DeliveryStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl DeliveryStream {
    pub fn new(rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self { rx }
    }

    /// Sender/stream pair for adapters that push deliveries.
    pub fn channel() -> (mpsc::UnboundedSender<Delivery>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Establishes broker connections.
#[async_trait]
pub trait Broker: Send + Sync + core::fmt::Debug {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + core::fmt::Debug {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection is closed, by either side.
    async fn closed(&self);

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A logical channel. Channels are not meant to be shared between concurrent flows.
#[async_trait]
pub trait BrokerChannel: Send + Sync + core::fmt::Debug {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries per consumer on this channel (0 = unlimited).
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Publish and wait for the broker's confirm. A negative confirm is
    /// [`BrokerError::Rejected`].
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError>;

    async fn basic_consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}
