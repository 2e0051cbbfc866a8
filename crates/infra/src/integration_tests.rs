//! End-to-end tests for the messaging pipeline.
//!
//! Tests: Producer → (Outbox) → Broker → Consumer → Handlers
//!
//! Verifies:
//! - Envelopes and their headers survive the trip to handlers
//! - Terminal failures reach the dead-letter queue exactly once, or are discarded
//! - Redelivering the same event does not repeat side effects of an idempotent handler
//! - Events saved during a broker outage are delivered once it recovers

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;

use courier_core::{EventId, HandlerError, ManualClock};
use courier_events::{
    HandlerDescriptor, HandlerExecutor, HandlerRegistry, MessageContext, MessageEnvelope, header,
    handler_fn,
};

use crate::broker::InMemoryBroker;
use crate::cache::{CacheStore, InMemoryCache};
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::consumer::{ConsumerOptions, EventConsumer, SubscriptionConfig, SubscriptionState};
use crate::outbox::{
    InMemoryOutboxStore, OutboxProcessor, OutboxProcessorConfig, OutboxStatus, OutboxStore,
};
use crate::producer::{EventProducer, ProducerConfig, PublishOptions, PublishOutcome};

const EXCHANGE: &str = "events";

fn manager(broker: &InMemoryBroker) -> ConnectionManager {
    ConnectionManager::new(
        Arc::new(broker.clone()),
        ConnectionConfig {
            reconnect_delay: Duration::from_millis(1),
            max_reconnect_attempts: 2,
        },
    )
}

fn producer(manager: &ConnectionManager) -> EventProducer {
    EventProducer::new(
        manager.clone(),
        ProducerConfig {
            service_name: "orders".into(),
            ..ProducerConfig::default()
        },
    )
}

fn options() -> ConsumerOptions {
    ConsumerOptions {
        retry_attempts: 2,
        retry_delay: Duration::from_millis(1),
        max_retry_delay: Duration::from_millis(4),
        shutdown_timeout: Duration::from_secs(1),
        resubscribe_delay: Duration::from_millis(5),
        ..ConsumerOptions::default()
    }
}

fn consumer_for(
    manager: &ConnectionManager,
    event_type: &str,
    descriptor: HandlerDescriptor,
) -> EventConsumer {
    let mut registry = HandlerRegistry::new();
    registry.register(event_type, descriptor).unwrap();
    EventConsumer::new(manager.clone(), HandlerExecutor::new(Arc::new(registry)))
}

fn placed(producer: &EventProducer, order: &str) -> MessageEnvelope {
    producer.envelope("order.placed", "Order", order, json!({ "order": order, "total": 42 }))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(check(), "condition not reached in time");
}

#[tokio::test]
async fn published_envelope_reaches_handler_intact() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker);
    let received = Arc::new(std::sync::Mutex::new(Vec::<MessageContext>::new()));
    let sink = received.clone();
    let consumer = consumer_for(
        &manager,
        "order.placed",
        HandlerDescriptor::new(
            "projector",
            handler_fn(move |ctx: MessageContext| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(ctx);
                    Ok(())
                }
            }),
        ),
    );
    consumer
        .subscribe(
            SubscriptionConfig::new("read-model", EXCHANGE).routing_key("order.*"),
            options(),
        )
        .await
        .unwrap();

    let producer = producer(&manager);
    let envelope = placed(&producer, "o-1").with_correlation("req-7");
    let outcome = producer
        .publish(&envelope, &PublishOptions::new())
        .await
        .unwrap();
    assert!(outcome.is_published());

    eventually(|| received.lock().unwrap().len() == 1).await;
    let ctx = received.lock().unwrap()[0].clone();
    assert_eq!(ctx.envelope, envelope);
    assert_eq!(ctx.routing_key, "order.placed");
    assert_eq!(ctx.exchange, EXCHANGE);
    assert_eq!(ctx.retry_count, 0);
    assert_eq!(ctx.headers[header::SOURCE_SERVICE], json!("orders"));
    assert_eq!(ctx.headers[header::CORRELATION_ID], json!("req-7"));
    assert_eq!(
        ctx.headers[header::MESSAGE_ID],
        json!(envelope.event_id().to_string())
    );

    consumer.shutdown(Duration::from_secs(1)).await;
    assert_eq!(consumer.state("read-model"), SubscriptionState::Unsubscribed);
}

#[tokio::test]
async fn exhausted_failures_are_dead_lettered_exactly_once() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker);
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let consumer = consumer_for(
        &manager,
        "order.placed",
        HandlerDescriptor::new(
            "mailer",
            handler_fn(move |_ctx| {
                let calls = counter.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::failed("smtp unavailable"))
                }
            }),
        ),
    );
    consumer
        .subscribe(
            SubscriptionConfig::new("mail", EXCHANGE).routing_key("order.placed"),
            options(),
        )
        .await
        .unwrap();

    let producer = producer(&manager);
    let envelope = placed(&producer, "o-2");
    producer
        .publish(&envelope, &PublishOptions::new())
        .await
        .unwrap();

    eventually(|| broker.queue_depth("mail.dlq") == 1).await;
    // Give a stray extra delivery the chance to show up.
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(broker.queue_depth("mail.dlq"), 1);
    assert_eq!(broker.queue_depth("mail"), 0);
    let dead = &broker.ready_messages("mail.dlq")[0];
    let dead_envelope = MessageEnvelope::from_json_slice(&dead.body).unwrap();
    assert_eq!(dead_envelope.event_id(), envelope.event_id());
    assert_eq!(dead_envelope.retry_count(), 2);
    assert_eq!(dead.properties.headers[header::RETRY_COUNT], json!(2));

    let stats = consumer.stats("mail").unwrap();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.acked, 0);
}

#[tokio::test]
async fn exhausted_failures_are_discarded_without_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker);
    let consumer = consumer_for(
        &manager,
        "order.placed",
        HandlerDescriptor::new(
            "mailer",
            handler_fn(|_ctx| async { Err(HandlerError::failed("smtp unavailable")) }),
        ),
    );
    consumer
        .subscribe(
            SubscriptionConfig::new("mail", EXCHANGE).routing_key("order.placed"),
            ConsumerOptions {
                dlq_enabled: false,
                ..options()
            },
        )
        .await
        .unwrap();

    let producer = producer(&manager);
    producer
        .publish(&placed(&producer, "o-3"), &PublishOptions::new())
        .await
        .unwrap();

    eventually(|| consumer.stats("mail").is_some_and(|s| s.discarded == 1)).await;
    assert_eq!(broker.queue_depth("mail"), 0);
    assert_eq!(broker.unacked_count("mail"), 0);
    assert!(broker.queue_arguments("mail.dlq").is_none());
}

#[tokio::test]
async fn redelivered_event_does_not_repeat_side_effects() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker);
    let seen = Arc::new(InMemoryCache::new());
    let invocations = Arc::new(AtomicU32::new(0));
    let applied = Arc::new(AtomicU32::new(0));
    let (cache, calls, effects) = (seen.clone(), invocations.clone(), applied.clone());
    let consumer = consumer_for(
        &manager,
        "order.placed",
        HandlerDescriptor::new(
            "ledger",
            handler_fn(move |ctx: MessageContext| {
                let (cache, calls, effects) = (cache.clone(), calls.clone(), effects.clone());
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let key = format!("ledger:{}", ctx.envelope.event_id());
                    let first = cache
                        .set_if_absent(&key, json!(true), Some(Duration::from_secs(3600)))
                        .await
                        .map_err(|e| HandlerError::failed(e.to_string()))?;
                    if first {
                        effects.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            }),
        ),
    );
    consumer
        .subscribe(
            SubscriptionConfig::new("ledger", EXCHANGE).routing_key("order.placed"),
            options(),
        )
        .await
        .unwrap();

    let producer = producer(&manager);
    let envelope = placed(&producer, "o-4");
    // An outbox replay sends the same event id again.
    for _ in 0..2 {
        producer
            .publish(&envelope, &PublishOptions::new())
            .await
            .unwrap();
    }

    eventually(|| invocations.load(Ordering::SeqCst) == 2).await;
    eventually(|| consumer.stats("ledger").is_some_and(|s| s.acked == 2)).await;
    assert_eq!(applied.load(Ordering::SeqCst), 1);
    assert_eq!(seen.len(), 1);
}

#[tokio::test]
async fn outbox_delivers_events_saved_during_an_outage() {
    let broker = InMemoryBroker::new();
    let manager = manager(&broker);
    let clock = ManualClock::starting_now();
    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));

    let delivered = Arc::new(std::sync::Mutex::new(Vec::<EventId>::new()));
    let sink = delivered.clone();
    let consumer = consumer_for(
        &manager,
        "order.placed",
        HandlerDescriptor::new(
            "shipping",
            handler_fn(move |ctx: MessageContext| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(ctx.envelope.event_id());
                    Ok(())
                }
            }),
        ),
    );
    consumer
        .subscribe(
            SubscriptionConfig::new("shipping", EXCHANGE).routing_key("order.placed"),
            options(),
        )
        .await
        .unwrap();

    broker.set_available(false);
    broker.kill_connections();

    let producer = producer(&manager)
        .with_outbox(store.clone())
        .with_clock(clock.clone());
    let envelope = placed(&producer, "o-5");
    let outcome = producer
        .publish(&envelope, &PublishOptions::new())
        .await
        .unwrap();
    let outbox_id = match &outcome {
        PublishOutcome::Deferred { outbox_id, .. } => *outbox_id,
        other => panic!("expected a deferred publish, got {other:?}"),
    };

    let processor = OutboxProcessor::with_clock(
        store.clone(),
        Arc::new(producer.clone()),
        OutboxProcessorConfig::default(),
        clock.clone(),
    );

    // Two polls while the broker is still down.
    for _ in 0..2 {
        clock.advance_std(Duration::from_secs(60));
        let report = processor.process_once().await.unwrap();
        assert_eq!(report.retried, 1);
    }
    let record = store.get(outbox_id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Failed);
    assert_eq!(record.retry_count, 3);
    assert!(record.next_retry_at.is_some());

    broker.set_available(true);
    eventually(|| consumer.state("shipping") == SubscriptionState::Consuming).await;
    clock.advance_std(Duration::from_secs(60));
    let report = processor.process_once().await.unwrap();
    assert_eq!(report.published, 1);

    let record = store.get(outbox_id).await.unwrap().unwrap();
    assert_eq!(record.status, OutboxStatus::Published);
    assert!(record.published_at.is_some());
    eventually(|| delivered.lock().unwrap().as_slice() == [envelope.event_id()]).await;
}
