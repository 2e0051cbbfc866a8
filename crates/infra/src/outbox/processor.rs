//! Outbox processor: moves saved events to the broker.
//!
//! A single tokio task polls the store every `poll_interval`, publishes each pending or
//! due record through an [`EnvelopePublisher`] (the producer's direct path, never the
//! outbox path) and records the outcome. Failed publishes are rescheduled with
//! exponential backoff until `max_retries` is spent, then marked terminally failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use courier_core::{SharedClock, SystemClock};
use courier_events::{MessageEnvelope, RetryPolicy};

use super::store::{OutboxStore, OutboxStoreError};
use super::types::OutboxEvent;
use crate::producer::PublishError;

/// Publishes an already validated envelope straight to the broker.
#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish_envelope(
        &self,
        envelope: &MessageEnvelope,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), PublishError>;
}

/// `tokio::time::interval` rejects a zero period.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Intervals below one millisecond are raised to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxProcessorConfig {
    pub poll_interval: Duration,
    /// Pending records per run
    pub batch_size: usize,
    /// Due retries per run
    pub retry_batch_size: usize,
    /// Delay after the first failed attempt; doubles per attempt
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub cleanup_interval: Duration,
    /// How long published rows are kept
    pub retention: Duration,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 50,
            retry_batch_size: 20,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl OutboxProcessorConfig {
    fn backoff(&self) -> RetryPolicy {
        RetryPolicy::exponential(u32::MAX, self.base_delay, self.max_delay)
    }
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Another run was in progress; nothing was done.
    pub skipped: bool,
    pub published: usize,
    pub retried: usize,
    pub failed: usize,
}

impl ProcessReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EnvelopePublisher>,
    config: OutboxProcessorConfig,
    clock: SharedClock,
    running: AtomicBool,
}

impl std::fmt::Debug for OutboxProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears the overlap flag when a run ends, including by cancellation.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EnvelopePublisher>,
        config: OutboxProcessorConfig,
    ) -> Self {
        Self::with_clock(store, publisher, config, SystemClock::shared())
    }

    pub fn with_clock(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EnvelopePublisher>,
        config: OutboxProcessorConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            clock,
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &OutboxProcessorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    /// Publish every pending record and every due retry once.
    ///
    /// Overlapping calls return immediately with a skipped report.
    #[instrument(skip(self), err)]
    pub async fn process_once(&self) -> Result<ProcessReport, OutboxStoreError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("outbox run already in progress");
            return Ok(ProcessReport::skipped());
        }
        let _guard = RunGuard(&self.running);

        let pending = self.store.find_pending(self.config.batch_size).await?;
        let retryable = self
            .store
            .find_retryable(self.clock.now(), self.config.retry_batch_size)
            .await?;

        let mut report = ProcessReport::default();
        for event in pending.into_iter().chain(retryable) {
            if let Err(e) = self.deliver(&event, &mut report).await {
                warn!(outbox_id = %event.id, error = %e, "failed to record outbox outcome");
            }
        }

        if report.published + report.retried + report.failed > 0 {
            info!(
                published = report.published,
                retried = report.retried,
                failed = report.failed,
                "outbox run finished"
            );
        }
        Ok(report)
    }

    async fn deliver(
        &self,
        event: &OutboxEvent,
        report: &mut ProcessReport,
    ) -> Result<(), OutboxStoreError> {
        let envelope = match event.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(outbox_id = %event.id, error = %e, "outbox record holds a corrupt envelope");
                self.store
                    .mark_failed(event.id, &format!("corrupt envelope: {e}"))
                    .await?;
                report.failed += 1;
                return Ok(());
            }
        };

        match self
            .publisher
            .publish_envelope(&envelope, &event.exchange, &event.routing_key)
            .await
        {
            Ok(()) => {
                self.store.mark_published(event.id, self.clock.now()).await?;
                debug!(outbox_id = %event.id, event_id = %envelope.event_id(), "outbox event published");
                report.published += 1;
            }
            Err(err) => {
                if self.record_failure(event, &err).await? {
                    report.retried += 1;
                } else {
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Schedule a retry or fail terminally. Returns whether a retry was scheduled.
    pub(crate) async fn record_failure(
        &self,
        event: &OutboxEvent,
        err: &PublishError,
    ) -> Result<bool, OutboxStoreError> {
        let message = err.to_string();
        if err.is_retryable() && event.retry_count < event.max_retries {
            let delay = self.config.backoff().delay_for_retry(event.retry_count);
            let next_retry_at = self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::days(36_500));
            self.store.mark_retry(event.id, next_retry_at, &message).await?;
            warn!(
                outbox_id = %event.id,
                retry_count = event.retry_count + 1,
                max_retries = event.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "outbox publish failed; retry scheduled"
            );
            Ok(true)
        } else {
            self.store.mark_failed(event.id, &message).await?;
            warn!(
                outbox_id = %event.id,
                retry_count = event.retry_count,
                error = %message,
                "outbox publish failed permanently"
            );
            Ok(false)
        }
    }

    /// Delete published records older than the retention window.
    #[instrument(skip(self), err)]
    pub async fn cleanup(&self) -> Result<u64, OutboxStoreError> {
        let retention =
            chrono::Duration::from_std(self.config.retention).unwrap_or(chrono::Duration::days(36_500));
        let cutoff = self.clock.now() - retention;
        let removed = self.store.delete_published_older_than(cutoff).await?;
        if removed > 0 {
            info!(removed, "outbox cleanup removed published events");
        }
        Ok(removed)
    }

    /// Run the poll and cleanup loops on a tokio task.
    pub fn spawn(self: Arc<Self>) -> ProcessorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut poll = tokio::time::interval(self.config.poll_interval.max(MIN_TICK));
            let mut cleanup = tokio::time::interval(self.config.cleanup_interval.max(MIN_TICK));
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                "outbox processor started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = poll.tick() => {
                        // Errors are logged by `instrument`; the next tick retries.
                        let _ = self.process_once().await;
                    }
                    _ = cleanup.tick() => {
                        let _ = self.cleanup().await;
                    }
                }
            }
            info!("outbox processor stopped");
        });

        ProcessorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

/// Handle to stop a running processor.
#[derive(Debug)]
pub struct ProcessorHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Request shutdown and wait for the current run to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};
    use courier_core::{Clock, ManualClock, OutboxEventId};
    use serde_json::json;

    use crate::broker::BrokerError;
    use crate::outbox::{InMemoryOutboxStore, OutboxStats, OutboxStatus};

    /// Publisher whose outcome the test flips.
    #[derive(Default)]
    struct SwitchPublisher {
        down: AtomicBool,
        non_retryable: AtomicBool,
        published: Mutex<Vec<MessageEnvelope>>,
    }

    #[async_trait]
    impl EnvelopePublisher for SwitchPublisher {
        async fn publish_envelope(
            &self,
            envelope: &MessageEnvelope,
            _exchange: &str,
            _routing_key: &str,
        ) -> Result<(), PublishError> {
            if self.non_retryable.load(Ordering::SeqCst) {
                return Err(PublishError::Serialization("bad payload".into()));
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(PublishError::Broker(BrokerError::Connection(
                    "broker unreachable".into(),
                )));
            }
            self.published.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Retry(DateTime<Utc>),
        Failed,
    }

    /// Store wrapper recording retry bookkeeping calls.
    struct RecordingStore {
        inner: InMemoryOutboxStore,
        calls: Mutex<Vec<Call>>,
    }

    #[async_trait]
    impl OutboxStore for RecordingStore {
        async fn save(&self, event: OutboxEvent) -> Result<OutboxEventId, OutboxStoreError> {
            self.inner.save(event).await
        }
        async fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
            self.inner.get(id).await
        }
        async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
            self.inner.find_pending(limit).await
        }
        async fn find_retryable(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
            self.inner.find_retryable(now, limit).await
        }
        async fn mark_published(
            &self,
            id: OutboxEventId,
            at: DateTime<Utc>,
        ) -> Result<(), OutboxStoreError> {
            self.inner.mark_published(id, at).await
        }
        async fn mark_retry(
            &self,
            id: OutboxEventId,
            next_retry_at: DateTime<Utc>,
            error: &str,
        ) -> Result<(), OutboxStoreError> {
            self.calls.lock().unwrap().push(Call::Retry(next_retry_at));
            self.inner.mark_retry(id, next_retry_at, error).await
        }
        async fn mark_failed(&self, id: OutboxEventId, error: &str) -> Result<(), OutboxStoreError> {
            self.calls.lock().unwrap().push(Call::Failed);
            self.inner.mark_failed(id, error).await
        }
        async fn cancel(&self, id: OutboxEventId) -> Result<(), OutboxStoreError> {
            self.inner.cancel(id).await
        }
        async fn delete_published_older_than(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<u64, OutboxStoreError> {
            self.inner.delete_published_older_than(cutoff).await
        }
        async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
            self.inner.stats().await
        }
    }

    fn record() -> OutboxEvent {
        let envelope = MessageEnvelope::new(
            "order.placed",
            "orders",
            "Order",
            "o-1",
            json!({ "total": 10 }),
        );
        OutboxEvent::from_envelope(&envelope, "events", "order.placed").unwrap()
    }

    fn processor(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<SwitchPublisher>,
        clock: Arc<ManualClock>,
    ) -> OutboxProcessor {
        OutboxProcessor::with_clock(store, publisher, OutboxProcessorConfig::default(), clock)
    }

    #[tokio::test]
    async fn publishes_pending_events() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
        let publisher = Arc::new(SwitchPublisher::default());
        let event = record();
        let id = store.save(event.clone()).await.unwrap();

        let report = processor(store.clone(), publisher.clone(), clock.clone())
            .process_once()
            .await
            .unwrap();

        assert_eq!(report.published, 1);
        let saved = store.get(id).await.unwrap().unwrap();
        assert_eq!(saved.status, OutboxStatus::Published);
        assert_eq!(saved.published_at, Some(clock.now()));
        // Replays keep the producer's event id.
        assert_eq!(
            publisher.published.lock().unwrap()[0].event_id(),
            event.to_envelope().unwrap().event_id()
        );
    }

    #[tokio::test]
    async fn retry_cap_is_three_retries_then_terminal_failure() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(RecordingStore {
            inner: InMemoryOutboxStore::with_clock(clock.clone()),
            calls: Mutex::new(Vec::new()),
        });
        let publisher = Arc::new(SwitchPublisher::default());
        publisher.down.store(true, Ordering::SeqCst);
        let processor = processor(store.clone(), publisher, clock.clone());
        let id = store.save(record()).await.unwrap();

        let mut attempt_times = Vec::new();
        for _ in 0..4 {
            attempt_times.push(clock.now());
            processor.process_once().await.unwrap();
            clock.advance(chrono::Duration::hours(1));
        }

        let calls = store.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        for (i, expected) in [1, 2, 4].into_iter().enumerate() {
            assert_eq!(
                calls[i],
                Call::Retry(attempt_times[i] + chrono::Duration::seconds(expected))
            );
        }
        assert_eq!(calls[3], Call::Failed);

        let event = store.get(id).await.unwrap().unwrap();
        assert!(event.is_terminal_failure());
        assert_eq!(event.retry_count, 3);
        let far_future = clock.now() + chrono::Duration::days(365);
        assert!(store.find_retryable(far_future, 10).await.unwrap().is_empty());

        // Nothing left to do.
        assert_eq!(processor.process_once().await.unwrap(), ProcessReport::default());
    }

    #[tokio::test]
    async fn recovers_after_a_short_outage() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
        let publisher = Arc::new(SwitchPublisher::default());
        publisher.down.store(true, Ordering::SeqCst);
        let processor = processor(store.clone(), publisher.clone(), clock.clone());
        let id = store.save(record()).await.unwrap();

        processor.process_once().await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        processor.process_once().await.unwrap();

        publisher.down.store(false, Ordering::SeqCst);
        // Not due yet (second retry waits 2s).
        assert_eq!(processor.process_once().await.unwrap().published, 0);
        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(processor.process_once().await.unwrap().published, 1);

        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Published);
        assert_eq!(event.retry_count, 2);
        assert!(event.published_at.is_some());
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
        let publisher = Arc::new(SwitchPublisher::default());
        publisher.non_retryable.store(true, Ordering::SeqCst);
        let id = store.save(record()).await.unwrap();

        let report = processor(store.clone(), publisher, clock)
            .process_once()
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        let event = store.get(id).await.unwrap().unwrap();
        assert!(event.is_terminal_failure());
        assert_eq!(event.retry_count, 0);
    }

    #[tokio::test]
    async fn corrupt_envelopes_fail_terminally() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
        let mut event = record();
        event.event_data = json!({ "not": "an envelope" });
        let id = store.save(event).await.unwrap();

        let report = processor(store.clone(), Arc::new(SwitchPublisher::default()), clock)
            .process_once()
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert!(store.get(id).await.unwrap().unwrap().is_terminal_failure());
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
        let processor = processor(store, Arc::new(SwitchPublisher::default()), clock);

        processor.running.store(true, Ordering::SeqCst);
        assert!(processor.process_once().await.unwrap().skipped);

        processor.running.store(false, Ordering::SeqCst);
        assert!(!processor.process_once().await.unwrap().skipped);
        assert!(!processor.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cleanup_respects_retention() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryOutboxStore::with_clock(clock.clone()));
        let old = store.save(record()).await.unwrap();
        let recent = store.save(record()).await.unwrap();
        store
            .mark_published(old, clock.now() - chrono::Duration::days(8))
            .await
            .unwrap();
        store.mark_published(recent, clock.now()).await.unwrap();

        let removed = processor(store.clone(), Arc::new(SwitchPublisher::default()), clock)
            .cleanup()
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(recent).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn spawned_processor_drains_and_stops() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(SwitchPublisher::default());
        let id = store.save(record()).await.unwrap();
        let config = OutboxProcessorConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let processor = Arc::new(OutboxProcessor::new(store.clone(), publisher, config));

        let handle = processor.spawn();
        for _ in 0..100 {
            if store.get(id).await.unwrap().unwrap().status == OutboxStatus::Published {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            OutboxStatus::Published
        );
    }

    #[tokio::test]
    async fn spawned_processor_tolerates_zero_intervals() {
        let store = InMemoryOutboxStore::arc();
        let publisher = Arc::new(SwitchPublisher::default());
        let id = store.save(record()).await.unwrap();
        let config = OutboxProcessorConfig {
            poll_interval: Duration::ZERO,
            cleanup_interval: Duration::ZERO,
            ..Default::default()
        };
        let processor = Arc::new(OutboxProcessor::new(store.clone(), publisher, config));

        let handle = processor.spawn();
        for _ in 0..100 {
            if store.get(id).await.unwrap().unwrap().status == OutboxStatus::Published {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;

        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            OutboxStatus::Published
        );
    }
}
