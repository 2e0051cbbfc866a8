//! RabbitMQ adapter (feature `amqp`).
//!
//! Channels are opened in publisher-confirm mode so `basic_publish` can report
//! negative confirms as [`BrokerError::Rejected`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldArray, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, ConsumeOptions, Delivery,
    DeliveryStream, ExchangeKind, ExchangeOptions, FieldTable, PublishProperties, QueueOptions,
};

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ at an `amqp://` URI.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    uri: String,
    connection_name: String,
}

impl AmqpBroker {
    pub fn new(uri: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection_name: connection_name.into(),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(skip(self), fields(connection_name = %self.connection_name), err)]
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let connection = lapin::Connection::connect(&self.uri, properties)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (closed_tx, _) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);
        let notify = closed_tx.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "amqp connection error");
            notify.send_replace(true);
        });

        Ok(Arc::new(AmqpConnection {
            connection,
            closed_tx,
        }))
    }
}

pub struct AmqpConnection {
    connection: lapin::Connection,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl core::fmt::Debug for AmqpConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("connected", &self.connection.status().connected())
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_error)?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && !*self.closed_tx.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let result = self
            .connection
            .close(REPLY_SUCCESS, "client shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()));
        self.closed_tx.send_replace(true);
        result
    }
}

#[derive(Debug)]
pub struct AmqpChannel {
    channel: lapin::Channel,
}

fn channel_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::Closed
        }
        other => BrokerError::Channel(other.to_string()),
    }
}

fn to_amqp_value(value: &JsonValue) -> AMQPValue {
    match value {
        JsonValue::Null => AMQPValue::Void,
        JsonValue::Bool(b) => AMQPValue::Boolean(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        JsonValue::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp_value).collect::<Vec<_>>()))
        }
        JsonValue::Object(map) => {
            let mut table = lapin::types::FieldTable::default();
            for (k, v) in map {
                table.insert(ShortString::from(k.clone()), to_amqp_value(v));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn from_amqp_value(value: &AMQPValue) -> JsonValue {
    match value {
        AMQPValue::Boolean(b) => JsonValue::from(*b),
        AMQPValue::ShortShortInt(i) => JsonValue::from(*i),
        AMQPValue::ShortShortUInt(i) => JsonValue::from(*i),
        AMQPValue::ShortInt(i) => JsonValue::from(*i),
        AMQPValue::ShortUInt(i) => JsonValue::from(*i),
        AMQPValue::LongInt(i) => JsonValue::from(*i),
        AMQPValue::LongUInt(i) => JsonValue::from(*i),
        AMQPValue::LongLongInt(i) => JsonValue::from(*i),
        AMQPValue::Float(f) => JsonValue::from(*f),
        AMQPValue::Double(f) => JsonValue::from(*f),
        AMQPValue::Timestamp(t) => JsonValue::from(*t),
        AMQPValue::ShortString(s) => JsonValue::from(s.as_str()),
        AMQPValue::LongString(s) => JsonValue::from(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::FieldArray(items) => {
            JsonValue::Array(items.as_slice().iter().map(from_amqp_value).collect())
        }
        AMQPValue::FieldTable(table) => JsonValue::Object(
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), from_amqp_value(v)))
                .collect(),
        ),
        _ => JsonValue::Null,
    }
}

fn to_amqp_table(table: &FieldTable) -> lapin::types::FieldTable {
    let mut out = lapin::types::FieldTable::default();
    for (k, v) in table {
        out.insert(ShortString::from(k.clone()), to_amqp_value(v));
    }
    out
}

fn from_amqp_table(table: &lapin::types::FieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .map(|(k, v)| (k.as_str().to_owned(), from_amqp_value(v)))
        .collect()
}

fn to_basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_headers(to_amqp_table(&properties.headers));
    if properties.persistent {
        basic = basic.with_delivery_mode(2);
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> PublishProperties {
    PublishProperties {
        persistent: *basic.delivery_mode() == Some(2),
        content_type: basic.content_type().as_ref().map(|s| s.as_str().to_owned()),
        message_id: basic.message_id().as_ref().map(|s| s.as_str().to_owned()),
        priority: *basic.priority(),
        headers: basic.headers().as_ref().map(from_amqp_table).unwrap_or_default(),
    }
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u64 {
        u64::from(self.channel.id())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                to_amqp_table(&options.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Topology(e.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await
            .map_err(channel_error)?
            .await
            .map_err(channel_error)?;

        match confirm {
            Confirmation::Nack(_) => Err(BrokerError::Rejected(format!(
                "broker nacked publish to '{exchange}' with key '{routing_key}'"
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                lapin::types::FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;

        let (tx, stream) = DeliveryStream::channel();
        let queue = queue.to_owned();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "amqp consumer stream failed");
                        break;
                    }
                };
                let forwarded = Delivery {
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    properties: from_basic_properties(&delivery.properties),
                    body: delivery.data,
                };
                if tx.send(forwarded).is_err() {
                    break;
                }
            }
            debug!(queue = %queue, "amqp consumer stream ended");
        });

        Ok(stream)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(channel_error)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(channel_error)
    }
}
