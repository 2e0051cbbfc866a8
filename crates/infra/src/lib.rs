//! Infrastructure layer: broker plumbing, outbox storage, producer and consumer.

pub mod broker;
pub mod cache;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod health;
pub mod outbox;
pub mod producer;

#[cfg(test)]
mod integration_tests;

pub use broker::{Broker, BrokerChannel, BrokerConnection, BrokerError, InMemoryBroker};
pub use cache::{CacheError, CacheStore, InMemoryCache};
pub use config::CourierConfig;
pub use connection::{ConnectionConfig, ConnectionHealth, ConnectionManager, ConnectionStatus};
pub use consumer::{
    ConsumerError, ConsumerOptions, ConsumerStatsSnapshot, EventConsumer, SubscriptionConfig,
    SubscriptionState, SubscriptionStatus,
};
pub use health::{HealthCheck, HealthReport, OverallStatus};
pub use producer::{
    BatchReport, BufferConfig, BufferedPublisher, EventProducer, ProducerConfig, PublishError,
    PublishOptions, PublishOutcome,
};
