//! Event consumer.
//!
//! Each subscription owns one broker channel and one loop task. The loop reads
//! deliveries, runs the handler executor for each on a separate task (at most
//! `prefetch` at a time) and settles every delivery itself once its task reports a
//! decision, so all acks, nacks and retry republishes on a channel come from one flow.
//!
//! Per delivery:
//! - body is not an envelope: nack without requeue (dead-letter or discard)
//! - envelope expired, or event type outside `filter_pattern`: ack and skip
//! - `delay_until` in the future: wait until due
//! - every handler succeeds: ack
//! - a handler rejects the message as invalid/unauthorized: nack without requeue
//! - otherwise, while `retry_count < retry_attempts`: wait the backoff, republish
//!   `envelope.with_retry()` to the queue through the default exchange and ack the
//!   original; once exhausted, nack without requeue
//!
//! Handlers see each `event_id` at least once and must be idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use courier_core::{SharedClock, SystemClock};
use courier_events::{
    BackoffStrategy, HandlerExecutor, MessageContext, MessageEnvelope, RetryPolicy, topic,
};

use crate::broker::{
    ARG_DEAD_LETTER_EXCHANGE, ARG_DEAD_LETTER_ROUTING_KEY, ARG_MAX_PRIORITY, BrokerChannel,
    BrokerError, ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, ExchangeOptions,
    PublishProperties, QueueOptions,
};
use crate::connection::ConnectionManager;

/// Broker topology of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_keys: Vec<String>,
    /// Unsettled deliveries in flight; also bounds handler concurrency. Must be at
    /// least 1: the broker's "0 means unlimited" has no bounded equivalent here.
    pub prefetch: u16,
    pub consumer_tag: Option<String>,
    /// Refuse to share the queue with other consumers.
    pub exclusive: bool,
    /// Enables queue priorities up to this value.
    pub priority: Option<u8>,
}

impl SubscriptionConfig {
    pub fn new(queue_name: impl Into<String>, exchange_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            exchange_name: exchange_name.into(),
            routing_keys: Vec::new(),
            prefetch: 10,
            consumer_tag: None,
            exclusive: false,
            priority: None,
        }
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_keys.push(key.into());
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn priority(mut self, max_priority: u8) -> Self {
        self.priority = Some(max_priority);
        self
    }

    /// `{exchange}.dlx`
    pub fn dead_letter_exchange(&self) -> String {
        format!("{}.dlx", self.exchange_name)
    }

    /// `{queue}.dlq`
    pub fn dead_letter_queue(&self) -> String {
        format!("{}.dlq", self.queue_name)
    }
}

/// Delivery behavior of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// The broker counts deliveries as settled when sent; the consumer never acks.
    pub auto_ack: bool,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub retry_backoff: BackoffStrategy,
    pub max_retry_delay: Duration,
    pub dlq_enabled: bool,
    /// Topic pattern on the event type; other events are acked and skipped.
    pub filter_pattern: Option<String>,
    /// How long unsubscribe waits for in-flight handlers.
    pub shutdown_timeout: Duration,
    /// Pause between attempts to restore a lost subscription.
    pub resubscribe_delay: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            auto_ack: false,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: BackoffStrategy::Exponential,
            max_retry_delay: Duration::from_secs(60),
            dlq_enabled: true,
            filter_pattern: None,
            shutdown_timeout: Duration::from_secs(30),
            resubscribe_delay: Duration::from_secs(5),
        }
    }
}

impl ConsumerOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.retry_backoff {
            BackoffStrategy::Fixed => RetryPolicy::fixed(self.retry_attempts, self.retry_delay),
            BackoffStrategy::Exponential => RetryPolicy::exponential(
                self.retry_attempts,
                self.retry_delay,
                self.max_retry_delay,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Consuming,
    Unsubscribing,
}

/// Per-subscription counters.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    acked: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
    malformed: AtomicU64,
    handler_failures: AtomicU64,
    resubscribed: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub acked: u64,
    /// Acked without running handlers (expired or filtered out).
    pub skipped: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Rejected with no dead-letter queue configured, or under auto-ack.
    pub discarded: u64,
    pub malformed: u64,
    pub handler_failures: u64,
    pub resubscribed: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            resubscribed: self.resubscribed.load(Ordering::Relaxed),
        }
    }
}

/// Operator-facing view of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatus {
    pub queue: String,
    pub state: SubscriptionState,
    pub stats: ConsumerStatsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("queue '{0}' already has a subscription")]
    AlreadySubscribed(String),

    #[error("no subscription for queue '{0}'")]
    NotSubscribed(String),

    #[error("queue '{0}' needs a prefetch of at least 1")]
    ZeroPrefetch(String),
}

impl ConsumerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::Broker(e) => e.is_retryable(),
            ConsumerError::AlreadySubscribed(_)
            | ConsumerError::NotSubscribed(_)
            | ConsumerError::ZeroPrefetch(_) => false,
        }
    }
}

/// State shared between a subscription's loop task and the consumer.
#[derive(Debug)]
struct SubscriptionShared {
    state: Mutex<SubscriptionState>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
    stats: ConsumerStats,
}

impl SubscriptionShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SubscriptionState::Subscribing),
            channel: Mutex::new(None),
            stats: ConsumerStats::default(),
        }
    }

    fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn set_channel(&self, channel: Option<Arc<dyn BrokerChannel>>) -> Option<Arc<dyn BrokerChannel>> {
        std::mem::replace(
            &mut *self.channel.lock().unwrap_or_else(|e| e.into_inner()),
            channel,
        )
    }
}

#[derive(Debug)]
struct Subscription {
    shared: Arc<SubscriptionShared>,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

/// Subscribes queues to handlers.
pub struct EventConsumer {
    connection: ConnectionManager,
    executor: HandlerExecutor,
    clock: SharedClock,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("queues", &self.queues())
            .finish_non_exhaustive()
    }
}

impl EventConsumer {
    pub fn new(connection: ConnectionManager, executor: HandlerExecutor) -> Self {
        Self {
            connection,
            executor,
            clock: SystemClock::shared(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Declare the subscription's topology and start consuming.
    #[instrument(
        skip(self, config, options),
        fields(queue = %config.queue_name, exchange = %config.exchange_name),
        err
    )]
    pub async fn subscribe(
        &self,
        config: SubscriptionConfig,
        options: ConsumerOptions,
    ) -> Result<(), ConsumerError> {
        let queue = config.queue_name.clone();
        if config.prefetch == 0 {
            return Err(ConsumerError::ZeroPrefetch(queue));
        }
        let shared = {
            let mut subscriptions = self.subscriptions();
            if subscriptions.contains_key(&queue) {
                return Err(ConsumerError::AlreadySubscribed(queue));
            }
            let shared = Arc::new(SubscriptionShared::new());
            subscriptions.insert(
                queue.clone(),
                Subscription {
                    shared: shared.clone(),
                    shutdown: None,
                    join: None,
                },
            );
            shared
        };

        let consumer_tag = config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{queue}-{}", uuid::Uuid::now_v7().simple()));
        let worker = Worker {
            connection: self.connection.clone(),
            executor: self.executor.clone(),
            clock: self.clock.clone(),
            config: Arc::new(config),
            options: Arc::new(options),
            shared: shared.clone(),
            consumer_tag,
        };

        let (channel, deliveries) = match worker.open().await {
            Ok(opened) => opened,
            Err(e) => {
                self.subscriptions().remove(&queue);
                shared.set_state(SubscriptionState::Unsubscribed);
                return Err(e.into());
            }
        };
        shared.set_state(SubscriptionState::Consuming);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(worker.run(channel, deliveries, shutdown_rx));

        let orphaned = {
            let mut subscriptions = self.subscriptions();
            match subscriptions.get_mut(&queue) {
                Some(subscription) => {
                    subscription.shutdown = Some(shutdown_tx);
                    subscription.join = Some(join);
                    None
                }
                None => Some((shutdown_tx, join)),
            }
        };
        if let Some((shutdown_tx, join)) = orphaned {
            // Unsubscribed while we were setting up.
            let _ = shutdown_tx.send(());
            let _ = join.await;
            return Ok(());
        }

        info!("subscription consuming");
        Ok(())
    }

    /// Stop consuming: cancel the broker consumer, let in-flight handlers finish
    /// within `shutdown_timeout`, then close the channel.
    #[instrument(skip(self), err)]
    pub async fn unsubscribe(&self, queue: &str) -> Result<(), ConsumerError> {
        let subscription = self
            .subscriptions()
            .remove(queue)
            .ok_or_else(|| ConsumerError::NotSubscribed(queue.to_owned()))?;
        stop(subscription, None, &self.connection, queue).await;
        Ok(())
    }

    /// Stop every subscription, waiting at most `timeout` overall before
    /// force-closing the stragglers.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) {
        let subscriptions: Vec<_> = self.subscriptions().drain().collect();
        let deadline = tokio::time::Instant::now() + timeout;

        for (_, subscription) in &subscriptions {
            subscription.shared.set_state(SubscriptionState::Unsubscribing);
        }
        let mut pending = Vec::with_capacity(subscriptions.len());
        for (queue, mut subscription) in subscriptions {
            if let Some(tx) = subscription.shutdown.take() {
                let _ = tx.send(());
            }
            pending.push((queue, subscription));
        }
        for (queue, subscription) in pending {
            stop(subscription, Some(deadline), &self.connection, &queue).await;
        }
        info!("consumer shut down");
    }

    pub fn state(&self, queue: &str) -> SubscriptionState {
        self.subscriptions()
            .get(queue)
            .map_or(SubscriptionState::Unsubscribed, |s| s.shared.state())
    }

    pub fn stats(&self, queue: &str) -> Option<ConsumerStatsSnapshot> {
        self.subscriptions()
            .get(queue)
            .map(|s| s.shared.stats.snapshot())
    }

    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<_> = self.subscriptions().keys().cloned().collect();
        queues.sort();
        queues
    }

    pub fn statuses(&self) -> Vec<SubscriptionStatus> {
        let mut statuses: Vec<_> = self
            .subscriptions()
            .iter()
            .map(|(queue, s)| SubscriptionStatus {
                queue: queue.clone(),
                state: s.shared.state(),
                stats: s.shared.stats.snapshot(),
            })
            .collect();
        statuses.sort_by(|a, b| a.queue.cmp(&b.queue));
        statuses
    }
}

/// Signal a subscription's loop and wait for it, force-closing past `deadline`.
async fn stop(
    mut subscription: Subscription,
    deadline: Option<tokio::time::Instant>,
    connection: &ConnectionManager,
    queue: &str,
) {
    subscription.shared.set_state(SubscriptionState::Unsubscribing);
    if let Some(tx) = subscription.shutdown.take() {
        let _ = tx.send(());
    }
    let Some(mut join) = subscription.join.take() else {
        subscription.shared.set_state(SubscriptionState::Unsubscribed);
        return;
    };

    let finished = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, &mut join).await.is_ok(),
        None => {
            let _ = (&mut join).await;
            true
        }
    };
    if !finished {
        warn!(queue, "subscription did not stop in time; force-closing");
        join.abort();
        if let Some(channel) = subscription.shared.set_channel(None) {
            connection.discard_channel(&channel).await;
        }
    }
    subscription.shared.set_state(SubscriptionState::Unsubscribed);
}

/// What to do with a delivery once its handlers ran.
#[derive(Debug)]
enum Decision {
    Ack,
    /// Republish the retried envelope, then ack the original.
    Retry {
        envelope: MessageEnvelope,
        properties: PublishProperties,
    },
    /// Nack without requeue.
    Reject { reason: String },
}

#[derive(Debug)]
struct Settlement {
    delivery_tag: u64,
    /// Channel the delivery arrived on; tags are channel-scoped.
    generation: u64,
    decision: Decision,
}

enum LoopEvent {
    Shutdown,
    Settled(Result<Settlement, JoinError>),
    Delivery(Option<Delivery>),
}

/// Runs one subscription.
#[derive(Clone)]
struct Worker {
    connection: ConnectionManager,
    executor: HandlerExecutor,
    clock: SharedClock,
    config: Arc<SubscriptionConfig>,
    options: Arc<ConsumerOptions>,
    shared: Arc<SubscriptionShared>,
    consumer_tag: String,
}

impl Worker {
    fn queue(&self) -> &str {
        &self.config.queue_name
    }

    /// Open a channel, declare topology and start consuming.
    async fn open(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), BrokerError> {
        let channel = self.connection.channel().await?;
        match self.setup(channel.as_ref()).await {
            Ok(deliveries) => {
                self.shared.set_channel(Some(channel.clone()));
                Ok((channel, deliveries))
            }
            Err(e) => {
                self.connection.discard_channel(&channel).await;
                Err(e)
            }
        }
    }

    async fn setup(&self, channel: &dyn BrokerChannel) -> Result<DeliveryStream, BrokerError> {
        let config = &self.config;
        channel
            .declare_exchange(
                &config.exchange_name,
                ExchangeKind::Topic,
                ExchangeOptions::durable(),
            )
            .await?;

        let mut queue_options = QueueOptions::durable();
        if self.options.dlq_enabled {
            let dlx = config.dead_letter_exchange();
            let dlq = config.dead_letter_queue();
            channel
                .declare_exchange(&dlx, ExchangeKind::Direct, ExchangeOptions::durable())
                .await?;
            channel.declare_queue(&dlq, QueueOptions::durable()).await?;
            channel.bind_queue(&dlq, &dlx, &config.queue_name).await?;
            queue_options = queue_options
                .with_argument(ARG_DEAD_LETTER_EXCHANGE, dlx)
                .with_argument(ARG_DEAD_LETTER_ROUTING_KEY, config.queue_name.clone());
        }
        if let Some(max_priority) = config.priority {
            queue_options = queue_options.with_argument(ARG_MAX_PRIORITY, max_priority);
        }
        channel
            .declare_queue(&config.queue_name, queue_options)
            .await?;

        for key in &config.routing_keys {
            channel
                .bind_queue(&config.queue_name, &config.exchange_name, key)
                .await?;
        }

        channel.basic_qos(config.prefetch).await?;
        channel
            .basic_consume(
                &config.queue_name,
                ConsumeOptions {
                    consumer_tag: self.consumer_tag.clone(),
                    no_ack: self.options.auto_ack,
                    exclusive: config.exclusive,
                },
            )
            .await
    }

    async fn run(
        self,
        mut channel: Arc<dyn BrokerChannel>,
        mut deliveries: DeliveryStream,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let semaphore = Arc::new(Semaphore::new(usize::from(self.config.prefetch)));
        let mut tasks: JoinSet<Settlement> = JoinSet::new();
        let mut generation = 0u64;

        loop {
            let event = tokio::select! {
                _ = &mut shutdown => LoopEvent::Shutdown,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => LoopEvent::Settled(joined),
                delivery = deliveries.next() => LoopEvent::Delivery(delivery),
            };

            match event {
                LoopEvent::Shutdown => break,
                LoopEvent::Settled(joined) => {
                    self.settle(channel.as_ref(), generation, joined).await;
                }
                LoopEvent::Delivery(Some(delivery)) => {
                    bump(&self.shared.stats.received);
                    let worker = self.clone();
                    let semaphore = semaphore.clone();
                    tasks.spawn(async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        let delivery_tag = delivery.delivery_tag;
                        Settlement {
                            delivery_tag,
                            generation,
                            decision: worker.process(delivery).await,
                        }
                    });
                }
                LoopEvent::Delivery(None) => {
                    warn!(queue = self.queue(), "delivery stream ended; resubscribing");
                    match self.recover(&mut shutdown).await {
                        Some((new_channel, new_deliveries)) => {
                            channel = new_channel;
                            deliveries = new_deliveries;
                            generation += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        self.drain(channel, tasks, generation).await;
    }

    /// Reopen the subscription after its channel or connection went away.
    async fn recover(
        &self,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Option<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        self.shared.set_state(SubscriptionState::Subscribing);
        if let Some(old) = self.shared.set_channel(None) {
            self.connection.discard_channel(&old).await;
        }

        loop {
            let opened = tokio::select! {
                _ = &mut *shutdown => return None,
                opened = self.open() => opened,
            };
            match opened {
                Ok(opened) => {
                    self.shared.set_state(SubscriptionState::Consuming);
                    bump(&self.shared.stats.resubscribed);
                    info!(queue = self.queue(), "subscription restored");
                    return Some(opened);
                }
                Err(e) => warn!(queue = self.queue(), error = %e, "resubscribe failed"),
            }
            tokio::select! {
                _ = &mut *shutdown => return None,
                _ = tokio::time::sleep(self.options.resubscribe_delay) => {}
            }
        }
    }

    /// Cancel the broker consumer, settle what finishes in time, close the channel.
    async fn drain(
        &self,
        channel: Arc<dyn BrokerChannel>,
        mut tasks: JoinSet<Settlement>,
        generation: u64,
    ) {
        self.shared.set_state(SubscriptionState::Unsubscribing);
        if let Err(e) = channel.basic_cancel(&self.consumer_tag).await {
            debug!(queue = self.queue(), error = %e, "consumer cancel failed");
        }

        let deadline = tokio::time::sleep(self.options.shutdown_timeout);
        tokio::pin!(deadline);
        while !tasks.is_empty() {
            tokio::select! {
                Some(joined) = tasks.join_next() => {
                    self.settle(channel.as_ref(), generation, joined).await;
                }
                _ = &mut deadline => {
                    warn!(
                        queue = self.queue(),
                        in_flight = tasks.len(),
                        "shutdown timeout reached; abandoning in-flight handlers"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        self.shared.set_channel(None);
        // Anything still unsettled goes back to the queue when the channel closes.
        self.connection.discard_channel(&channel).await;
        self.shared.set_state(SubscriptionState::Unsubscribed);
        info!(queue = self.queue(), "subscription closed");
    }

    /// Decide what happens to one delivery. Runs on its own task.
    async fn process(&self, delivery: Delivery) -> Decision {
        let stats = &self.shared.stats;
        let envelope = match MessageEnvelope::from_json_slice(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                bump(&stats.malformed);
                warn!(
                    queue = self.queue(),
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "malformed message"
                );
                return Decision::Reject {
                    reason: format!("malformed message: {e}"),
                };
            }
        };

        let now = self.clock.now();
        if envelope.is_expired(now) {
            bump(&stats.skipped);
            debug!(event_id = %envelope.event_id(), "envelope expired; skipping");
            return Decision::Ack;
        }
        if let Some(pattern) = &self.options.filter_pattern {
            if !topic::matches(pattern, envelope.event_type()) {
                bump(&stats.skipped);
                debug!(event_id = %envelope.event_id(), pattern = %pattern, "filtered out");
                return Decision::Ack;
            }
        }
        if let Some(delay_until) = envelope.metadata().delay_until.filter(|at| *at > now) {
            let wait = (delay_until - now).to_std().unwrap_or_default();
            debug!(event_id = %envelope.event_id(), wait_ms = wait.as_millis() as u64, "delaying until due");
            tokio::time::sleep(wait).await;
        }

        let retry_count = envelope.retry_count();
        let ctx = MessageContext {
            envelope: envelope.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            routing_key: delivery.routing_key.clone(),
            exchange: delivery.exchange.clone(),
            headers: delivery.properties.headers.clone(),
            retry_count,
        };

        // Handlers run on their own task so a panic fails the message, not the loop.
        let executor = self.executor.clone();
        let handled = tokio::spawn(async move { executor.execute_handlers(&ctx).await }).await;

        let (reason, policy) = match handled {
            Ok(report) if report.all_succeeded() => return Decision::Ack,
            Ok(report) => {
                bump(&stats.handler_failures);
                let reason = report
                    .first_error()
                    .map_or_else(|| "handler failed".to_owned(), ToString::to_string);
                if report.has_non_retryable_failure() {
                    return Decision::Reject { reason };
                }
                (reason, report.retry_policy)
            }
            Err(e) => {
                bump(&stats.handler_failures);
                error!(event_id = %envelope.event_id(), error = %e, "handler task panicked");
                (format!("handler panicked: {e}"), None)
            }
        };

        let policy = policy.unwrap_or_else(|| self.options.retry_policy());
        if !policy.should_retry(retry_count) {
            warn!(
                queue = self.queue(),
                event_id = %envelope.event_id(),
                retry_count,
                error = %reason,
                "retries exhausted"
            );
            return Decision::Reject { reason };
        }

        let delay = policy.delay_for_retry(retry_count);
        debug!(
            event_id = %envelope.event_id(),
            retry_count,
            delay_ms = delay.as_millis() as u64,
            "scheduling retry"
        );
        tokio::time::sleep(delay).await;

        let retried = envelope.with_retry();
        let mut headers = delivery.properties.headers;
        headers.extend(retried.headers());
        Decision::Retry {
            envelope: retried,
            properties: PublishProperties {
                headers,
                ..delivery.properties
            },
        }
    }

    /// Ack, nack or republish on the loop's channel.
    async fn settle(
        &self,
        channel: &dyn BrokerChannel,
        generation: u64,
        joined: Result<Settlement, JoinError>,
    ) {
        let settlement = match joined {
            Ok(settlement) => settlement,
            Err(e) => {
                error!(queue = self.queue(), error = %e, "delivery task failed");
                return;
            }
        };
        if settlement.generation != generation {
            debug!(
                queue = self.queue(),
                delivery_tag = settlement.delivery_tag,
                "delivery belongs to a closed channel; broker redelivers it"
            );
            return;
        }

        let stats = &self.shared.stats;
        let tag = settlement.delivery_tag;
        let auto_ack = self.options.auto_ack;

        let result = match settlement.decision {
            Decision::Ack => {
                bump(&stats.acked);
                if auto_ack { Ok(()) } else { channel.basic_ack(tag).await }
            }
            Decision::Reject { reason } => {
                // Auto-acked deliveries are already gone; there is nothing to dead-letter.
                let dead_lettered = self.options.dlq_enabled && !auto_ack;
                if dead_lettered {
                    bump(&stats.dead_lettered);
                } else {
                    bump(&stats.discarded);
                }
                warn!(
                    queue = self.queue(),
                    delivery_tag = tag,
                    dead_lettered,
                    reason = %reason,
                    "message rejected"
                );
                if auto_ack {
                    Ok(())
                } else {
                    channel.basic_nack(tag, false).await
                }
            }
            Decision::Retry {
                envelope,
                properties,
            } => match self.republish(channel, &envelope, &properties).await {
                Ok(()) => {
                    bump(&stats.retried);
                    if auto_ack { Ok(()) } else { channel.basic_ack(tag).await }
                }
                Err(e) => {
                    warn!(
                        queue = self.queue(),
                        event_id = %envelope.event_id(),
                        error = %e,
                        "retry republish failed; requeueing"
                    );
                    if auto_ack {
                        Ok(())
                    } else {
                        channel.basic_nack(tag, true).await
                    }
                }
            },
        };

        if let Err(e) = result {
            warn!(queue = self.queue(), delivery_tag = tag, error = %e, "failed to settle delivery");
        }
    }

    async fn republish(
        &self,
        channel: &dyn BrokerChannel,
        envelope: &MessageEnvelope,
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let body = envelope
            .to_json_bytes()
            .map_err(|e| BrokerError::Channel(format!("failed to serialize retry: {e}")))?;
        channel
            .basic_publish("", &self.config.queue_name, &body, properties)
            .await
    }
}
