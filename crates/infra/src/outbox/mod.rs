//! Transactional outbox.
//!
//! Events are saved next to the business write that produced them and published by
//! the [`OutboxProcessor`] afterwards, giving at-least-once delivery across crashes
//! between the write and the publish.

pub mod postgres;
pub mod processor;
pub mod store;
pub mod types;

pub use postgres::PostgresOutboxStore;
pub use processor::{
    EnvelopePublisher, OutboxProcessor, OutboxProcessorConfig, ProcessReport, ProcessorHandle,
};
pub use store::{InMemoryOutboxStore, OutboxStore, OutboxStoreError};
pub use types::{DEFAULT_MAX_RETRIES, OutboxEvent, OutboxStats, OutboxStatus};
