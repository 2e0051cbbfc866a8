//! Aggregated, serializable health snapshot for operators.

use serde::Serialize;

use courier_events::{CircuitBreakerState, CircuitState, HandlerRegistry};

use crate::connection::{ConnectionHealth, ConnectionManager, ConnectionStatus};
use crate::consumer::{EventConsumer, SubscriptionState, SubscriptionStatus};
use crate::outbox::{OutboxStats, OutboxStore, OutboxStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    /// Connected, but a breaker is open or a subscription is re-establishing.
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerHealth {
    pub name: String,
    #[serde(flatten)]
    pub state: CircuitBreakerState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub connection: ConnectionHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<OutboxStats>,
    pub circuit_breakers: Vec<BreakerHealth>,
    pub subscriptions: Vec<SubscriptionStatus>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == OverallStatus::Healthy
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Collects a [`HealthReport`] from whichever components the process runs.
#[derive(Default)]
pub struct HealthCheck<'a> {
    connection: Option<&'a ConnectionManager>,
    outbox: Option<&'a dyn OutboxStore>,
    registry: Option<&'a HandlerRegistry>,
    consumer: Option<&'a EventConsumer>,
}

impl<'a> HealthCheck<'a> {
    pub fn new(connection: &'a ConnectionManager) -> Self {
        Self {
            connection: Some(connection),
            ..Default::default()
        }
    }

    pub fn outbox(mut self, store: &'a dyn OutboxStore) -> Self {
        self.outbox = Some(store);
        self
    }

    pub fn registry(mut self, registry: &'a HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn consumer(mut self, consumer: &'a EventConsumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub async fn report(&self) -> Result<HealthReport, OutboxStoreError> {
        let connection = self.connection.map_or(
            ConnectionHealth {
                status: ConnectionStatus::Disconnected,
                active_channels: 0,
            },
            ConnectionManager::health,
        );
        let outbox = match self.outbox {
            Some(store) => Some(store.stats().await?),
            None => None,
        };
        let circuit_breakers: Vec<_> = self
            .registry
            .map(|r| {
                r.circuit_breakers()
                    .map(|b| BreakerHealth {
                        name: b.name().to_owned(),
                        state: b.snapshot(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let subscriptions = self
            .consumer
            .map(EventConsumer::statuses)
            .unwrap_or_default();

        let status = if connection.status != ConnectionStatus::Connected {
            OverallStatus::Unhealthy
        } else if circuit_breakers
            .iter()
            .any(|b| b.state.state == CircuitState::Open)
            || subscriptions
                .iter()
                .any(|s| s.state != SubscriptionState::Consuming)
        {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        Ok(HealthReport {
            status,
            connection,
            outbox,
            circuit_breakers,
            subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use courier_core::HandlerError;
    use courier_events::{CircuitBreakerConfig, HandlerDescriptor, handler_fn};
    use serde_json::json;

    use crate::broker::InMemoryBroker;
    use crate::connection::ConnectionConfig;
    use crate::outbox::{InMemoryOutboxStore, OutboxEvent};

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionConfig {
                reconnect_delay: Duration::from_millis(1),
                max_reconnect_attempts: 1,
            },
        )
    }

    #[tokio::test]
    async fn disconnected_process_is_unhealthy() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let report = HealthCheck::new(&manager).report().await.unwrap();

        assert_eq!(report.status, OverallStatus::Unhealthy);
        assert_eq!(report.connection.status, ConnectionStatus::Disconnected);
        assert!(report.outbox.is_none());
    }

    #[tokio::test]
    async fn report_includes_outbox_counts_and_serializes() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();
        let store = InMemoryOutboxStore::new();
        let envelope = courier_events::MessageEnvelope::new(
            "order.placed",
            "orders",
            "Order",
            "o-1",
            json!({}),
        );
        store
            .save(OutboxEvent::from_envelope(&envelope, "events", "order.placed").unwrap())
            .await
            .unwrap();

        let report = HealthCheck::new(&manager)
            .outbox(&store)
            .report()
            .await
            .unwrap();

        assert!(report.is_healthy());
        assert_eq!(report.outbox.as_ref().unwrap().pending, 1);
        let json = report.to_json().unwrap();
        assert_eq!(json["status"], json!("healthy"));
        assert_eq!(json["connection"]["status"], json!("connected"));
        assert_eq!(json["outbox"]["pending"], json!(1));
    }

    #[tokio::test]
    async fn open_breaker_degrades_health() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        let mut registry = HandlerRegistry::new();
        let descriptor = HandlerDescriptor::new("noop", handler_fn(|_ctx| async { Ok(()) }))
            .with_circuit_breaker(CircuitBreakerConfig::default());
        registry.register("order.placed", descriptor).unwrap();
        for breaker in registry.circuit_breakers() {
            for _ in 0..breaker.config().failure_threshold {
                let _ = breaker
                    .execute(|| async { Err::<(), _>(HandlerError::failed("db down")) })
                    .await;
            }
        }

        let report = HealthCheck::new(&manager)
            .registry(&registry)
            .report()
            .await
            .unwrap();

        assert_eq!(report.status, OverallStatus::Degraded);
        assert_eq!(report.circuit_breakers.len(), 1);
        let json = report.to_json().unwrap();
        assert_eq!(json["status"], json!("degraded"));
        assert_eq!(json["circuit_breakers"][0]["state"], json!("open"));
    }
}
