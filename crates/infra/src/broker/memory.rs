//! Process-local broker with AMQP 0-9-1 routing semantics.
//!
//! Supports what the rest of the crate relies on:
//! - direct, topic (`*` / `#`) and fanout exchanges, plus the default exchange
//!   (routing key = queue name)
//! - per-consumer prefetch, round-robin dispatch and redelivery of unsettled
//!   messages when a channel or connection closes
//! - dead-lettering through `x-dead-letter-exchange` / `x-dead-letter-routing-key`
//! - fault injection: refusing connections, killing live connections and
//!   negatively confirming publishes
//!
//! Not durable: state lives as long as the broker value.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use courier_events::topic;

use super::{
    ARG_DEAD_LETTER_EXCHANGE, ARG_DEAD_LETTER_ROUTING_KEY, Broker, BrokerChannel,
    BrokerConnection, BrokerError, ConsumeOptions, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, FieldTable, PublishProperties, QueueOptions,
};

/// Header added to dead-lettered messages: queue they were rejected from.
pub const HEADER_DEATH_QUEUE: &str = "x-first-death-queue";
/// Header added to dead-lettered messages: why they were dead-lettered.
pub const HEADER_DEATH_REASON: &str = "x-first-death-reason";

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
    pub redelivered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    connections: Mutex<Vec<Arc<ConnectionState>>>,
    unavailable: AtomicBool,
    reject_publishes: AtomicU32,
    next_id: AtomicU64,
    published: AtomicU64,
    settlements: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, ChannelState>,
}

#[derive(Debug, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct QueueState {
    arguments: FieldTable,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
}

#[derive(Debug)]
struct ConsumerState {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Default)]
struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

impl State {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Channel(format!("NOT_FOUND - no exchange '{exchange}'")))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic::matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout => true,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_back(message);
        }
        self.dispatch(queue);
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_front(message);
        }
        self.dispatch(queue);
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage) {
        let Some(q) = self.queues.get(queue) else {
            return;
        };
        let Some(dlx) = q
            .arguments
            .get(ARG_DEAD_LETTER_EXCHANGE)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
        else {
            debug!(queue, "message discarded (no dead-letter exchange)");
            return;
        };
        let routing_key = q
            .arguments
            .get(ARG_DEAD_LETTER_ROUTING_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| message.routing_key.clone());

        message
            .properties
            .headers
            .insert(HEADER_DEATH_QUEUE.to_owned(), queue.into());
        message
            .properties
            .headers
            .insert(HEADER_DEATH_REASON.to_owned(), "rejected".into());
        message.exchange = dlx.clone();
        message.routing_key = routing_key.clone();
        message.redelivered = false;

        match self.route(&dlx, &routing_key) {
            Ok(targets) => {
                for target in targets {
                    self.enqueue(&target, message.clone());
                }
            }
            Err(e) => warn!(queue, dlx = %dlx, error = %e, "dead-letter exchange missing, message dropped"),
        }
    }

    /// Hand ready messages to consumers that have prefetch capacity.
    fn dispatch(&mut self, queue_name: &str) {
        let State {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        loop {
            queue.consumers.retain(|c| !c.tx.is_closed());
            let n = queue.consumers.len();
            if queue.ready.is_empty() || n == 0 {
                return;
            }

            let chosen = (0..n).map(|offset| (queue.cursor + offset) % n).find(|&idx| {
                let consumer = &queue.consumers[idx];
                if consumer.no_ack {
                    return true;
                }
                channels.get(&consumer.channel_id).is_some_and(|ch| {
                    ch.prefetch == 0
                        || ch
                            .unacked
                            .values()
                            .filter(|u| u.consumer_tag == consumer.tag)
                            .count()
                            < usize::from(ch.prefetch)
                })
            });
            let Some(idx) = chosen else {
                return;
            };
            queue.cursor = (idx + 1) % n;

            let consumer = &queue.consumers[idx];
            let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            channel.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: channel.next_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if consumer.tx.send(delivery).is_err() {
                queue.ready.push_front(message);
                queue.consumers.remove(idx);
                continue;
            }
            if !consumer.no_ack {
                channel.unacked.insert(
                    channel.next_tag,
                    Unacked {
                        queue: queue_name.to_owned(),
                        consumer_tag: consumer.tag.clone(),
                        message,
                    },
                );
            }
        }
    }

    /// Drop a channel: its consumers go away and unsettled messages are requeued.
    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        let mut unacked: Vec<(u64, Unacked)> = channel.unacked.into_iter().collect();
        unacked.sort_by(|a, b| b.0.cmp(&a.0));
        let mut touched = Vec::new();
        for (_, entry) in unacked {
            let mut message = entry.message;
            message.redelivered = true;
            if let Some(q) = self.queues.get_mut(&entry.queue) {
                q.ready.push_front(message);
            }
            if !touched.contains(&entry.queue) {
                touched.push(entry.queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (`false`) or accept (`true`) new connections.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Close every live connection from the broker side.
    pub fn kill_connections(&self) {
        let connections: Vec<_> = {
            let mut guard = self
                .shared
                .connections
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for connection in connections {
            close_connection(&self.shared, &connection);
        }
    }

    /// Negatively confirm the next `count` publishes.
    pub fn reject_next_publishes(&self, count: u32) {
        self.shared.reject_publishes.store(count, Ordering::SeqCst);
    }

    pub fn published_count(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    /// Acks and nacks received on any channel, including ones for unknown tags.
    pub fn settlement_count(&self) -> u64 {
        self.shared.settlements.load(Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> usize {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    /// Messages waiting in `queue` (not delivered, or requeued).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet settled messages from `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Copy of the messages waiting in `queue`.
    pub fn ready_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.shared.lock().exchanges.get(exchange).copied()
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.shared.lock().queues.get(queue).map(|q| q.arguments.clone())
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.shared.lock().bindings.contains(&Binding {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        })
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection refused".into()));
        }

        let (closed_tx, _) = watch::channel(false);
        let state = Arc::new(ConnectionState {
            id: self.shared.next_id(),
            open: AtomicBool::new(true),
            closed_tx,
        });
        {
            let mut connections = self
                .shared
                .connections
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            connections.retain(|c| c.open.load(Ordering::SeqCst));
            connections.push(state.clone());
        }
        debug!(connection_id = state.id, "in-memory connection opened");

        Ok(Arc::new(InMemoryConnection {
            state,
            shared: self.shared.clone(),
        }))
    }
}

#[derive(Debug)]
struct ConnectionState {
    id: u64,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

fn close_connection(shared: &Shared, connection: &ConnectionState) {
    if !connection.open.swap(false, Ordering::SeqCst) {
        return;
    }
    {
        let mut state = shared.lock();
        let channel_ids: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection.id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            state.close_channel(id);
        }
    }
    connection.closed_tx.send_replace(true);
    debug!(connection_id = connection.id, "in-memory connection closed");
}

#[derive(Debug)]
pub struct InMemoryConnection {
    state: Arc<ConnectionState>,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Connection("connection is closed".into()));
        }
        let id = self.shared.next_id();
        self.shared.lock().channels.insert(
            id,
            ChannelState {
                connection_id: self.state.id,
                ..Default::default()
            },
        );
        Ok(Arc::new(InMemoryChannel {
            id,
            connection: self.state.clone(),
            shared: self.shared.clone(),
            open: AtomicBool::new(true),
        }))
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        let mut rx = self.state.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Closed);
        }
        close_connection(&self.shared, &self.state);
        Ok(())
    }
}

#[derive(Debug)]
pub struct InMemoryChannel {
    id: u64,
    connection: Arc<ConnectionState>,
    shared: Arc<Shared>,
    open: AtomicBool,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.connection.open.load(Ordering::SeqCst)
            && self.shared.lock().channels.contains_key(&self.id)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(BrokerError::Topology(
                "ACCESS_REFUSED - the default exchange cannot be declared".into(),
            ));
        }
        let mut state = self.shared.lock();
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(BrokerError::Topology(format!(
                "PRECONDITION_FAILED - exchange '{name}' is {}, not {}",
                existing.as_str(),
                kind.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        match state.queues.get(name) {
            Some(existing) if existing.arguments != options.arguments => {
                Err(BrokerError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{name}'"
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_owned(),
                    QueueState {
                        arguments: options.arguments,
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Channel(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        let binding = Binding {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        let channel = state.channels.get_mut(&self.id).ok_or(BrokerError::Closed)?;
        channel.prefetch = prefetch_count;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let rejected = self
            .shared
            .reject_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BrokerError::Rejected("negative confirm".into()));
        }

        let mut state = self.shared.lock();
        let targets = state.route(exchange, routing_key)?;
        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            properties: properties.clone(),
            redelivered: false,
        };
        for target in targets {
            state.enqueue(&target, message.clone());
        }
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        let tag = if options.consumer_tag.is_empty() {
            format!("ctag-{}", self.shared.next_id())
        } else {
            options.consumer_tag
        };

        let mut state = self.shared.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::Channel(format!("NOT_FOUND - no queue '{queue}'")))?;
        if q.consumers.iter().any(|c| c.tag == tag) {
            return Err(BrokerError::Channel(format!(
                "NOT_ALLOWED - consumer tag '{tag}' already in use"
            )));
        }
        if options.exclusive && !q.consumers.is_empty() {
            return Err(BrokerError::Channel(format!(
                "ACCESS_REFUSED - queue '{queue}' already has consumers"
            )));
        }

        let (tx, stream) = DeliveryStream::channel();
        q.consumers.push(ConsumerState {
            tag,
            channel_id: self.id,
            no_ack: options.no_ack,
            tx,
        });
        state.dispatch(queue);
        Ok(stream)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.settlements.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.lock();
        let entry = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                BrokerError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
            })?;
        state.dispatch(&entry.queue);
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.shared.settlements.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.lock();
        let entry = state
            .channels
            .get_mut(&self.id)
            .and_then(|c| c.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                BrokerError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
            })?;

        if requeue {
            state.requeue(&entry.queue, entry.message);
        } else {
            state.dead_letter(&entry.queue, entry.message);
            state.dispatch(&entry.queue);
        }
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        self.shared.lock().close_channel(self.id);
        Ok(())
    }
}
