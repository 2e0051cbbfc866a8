//! Outbox storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use courier_core::{OutboxEventId, SharedClock, SystemClock};

use super::types::{OutboxEvent, OutboxStats, OutboxStatus};

/// Outbox store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("outbox event not found: {0}")]
    NotFound(OutboxEventId),

    #[error("outbox event {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: OutboxEventId,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    #[error("outbox serialization error: {0}")]
    Serialization(String),

    #[error("outbox storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for OutboxStoreError {
    fn from(err: serde_json::Error) -> Self {
        OutboxStoreError::Serialization(err.to_string())
    }
}

/// Durable record of events pending publication.
///
/// `save` only inserts `Pending` records; callers must run it in the same local
/// transaction as the business write that produced the event. After creation only
/// the outbox processor (and the producer's immediate-publish attempt) move records
/// between states.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn save(&self, event: OutboxEvent) -> Result<OutboxEventId, OutboxStoreError>;

    async fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError>;

    /// Oldest `Pending` records first.
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// `Failed` records whose scheduled retry is due at `now`.
    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError>;

    /// Publishing an already published record is a no-op.
    async fn mark_published(
        &self,
        id: OutboxEventId,
        published_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Record a failed attempt: increments `retry_count`, sets status `Failed` and
    /// schedules the next attempt.
    async fn mark_retry(
        &self,
        id: OutboxEventId,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), OutboxStoreError>;

    /// Terminal failure: the record is never selected again.
    async fn mark_failed(&self, id: OutboxEventId, error: &str) -> Result<(), OutboxStoreError>;

    /// Withdraw a record that has not been delivered yet.
    async fn cancel(&self, id: OutboxEventId) -> Result<(), OutboxStoreError>;

    async fn delete_published_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

/// In-memory outbox store for tests/dev.
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    events: RwLock<HashMap<OutboxEventId, OutboxEvent>>,
    clock: SharedClock,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of every record, oldest first.
    pub fn all(&self) -> Vec<OutboxEvent> {
        let mut events: Vec<_> = self.read().values().cloned().collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        events
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<OutboxEventId, OutboxEvent>> {
        self.events.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<OutboxEventId, OutboxEvent>> {
        self.events.write().unwrap_or_else(|e| e.into_inner())
    }

    fn update<F>(&self, id: OutboxEventId, to: OutboxStatus, f: F) -> Result<(), OutboxStoreError>
    where
        F: FnOnce(&mut OutboxEvent) -> Result<(), ()>,
    {
        let mut events = self.write();
        let event = events.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        let from = event.status;
        f(event).map_err(|()| OutboxStoreError::InvalidTransition { id, from, to })?;
        event.updated_at = self.clock.now();
        Ok(())
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn save(&self, event: OutboxEvent) -> Result<OutboxEventId, OutboxStoreError> {
        if event.status != OutboxStatus::Pending {
            return Err(OutboxStoreError::InvalidTransition {
                id: event.id,
                from: event.status,
                to: OutboxStatus::Pending,
            });
        }
        let mut events = self.write();
        if events.contains_key(&event.id) {
            return Err(OutboxStoreError::Storage(format!(
                "outbox event already exists: {}",
                event.id
            )));
        }
        let id = event.id;
        events.insert(id, event);
        Ok(id)
    }

    async fn get(&self, id: OutboxEventId) -> Result<Option<OutboxEvent>, OutboxStoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let mut pending: Vec<_> = self
            .read()
            .values()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.created_at, e.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn find_retryable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxStoreError> {
        let mut due: Vec<_> = self
            .read()
            .values()
            .filter(|e| e.is_retryable_at(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.next_retry_at, e.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_published(
        &self,
        id: OutboxEventId,
        published_at: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        self.update(id, OutboxStatus::Published, |e| {
            if e.status == OutboxStatus::Published {
                return Ok(());
            }
            if !e.is_deliverable() {
                return Err(());
            }
            e.status = OutboxStatus::Published;
            e.published_at = Some(published_at);
            e.next_retry_at = None;
            Ok(())
        })
    }

    async fn mark_retry(
        &self,
        id: OutboxEventId,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), OutboxStoreError> {
        self.update(id, OutboxStatus::Failed, |e| {
            if !e.is_deliverable() {
                return Err(());
            }
            e.status = OutboxStatus::Failed;
            e.retry_count = e.retry_count.saturating_add(1);
            e.next_retry_at = Some(next_retry_at);
            e.last_error = Some(error.to_owned());
            Ok(())
        })
    }

    async fn mark_failed(&self, id: OutboxEventId, error: &str) -> Result<(), OutboxStoreError> {
        self.update(id, OutboxStatus::Failed, |e| {
            if !e.is_deliverable() {
                return Err(());
            }
            e.status = OutboxStatus::Failed;
            e.next_retry_at = None;
            e.last_error = Some(error.to_owned());
            Ok(())
        })
    }

    async fn cancel(&self, id: OutboxEventId) -> Result<(), OutboxStoreError> {
        self.update(id, OutboxStatus::Cancelled, |e| {
            if !e.is_deliverable() {
                return Err(());
            }
            e.status = OutboxStatus::Cancelled;
            e.next_retry_at = None;
            Ok(())
        })
    }

    async fn delete_published_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, OutboxStoreError> {
        let mut events = self.write();
        let before = events.len();
        events.retain(|_, e| {
            !(e.status == OutboxStatus::Published && e.published_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - events.len()) as u64)
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let events = self.read();
        let mut stats = OutboxStats::default();
        for event in events.values() {
            match event.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Cancelled => stats.cancelled += 1,
            }
            stats.total_retries += u64::from(event.retry_count);
        }
        Ok(stats)
    }
}
