//! Outbox relay: drains the Postgres outbox into RabbitMQ until interrupted.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use courier_infra::broker::amqp::AmqpBroker;
use courier_infra::outbox::{OutboxProcessor, PostgresOutboxStore};
use courier_infra::{ConnectionManager, CourierConfig, EventProducer, HealthCheck};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = CourierConfig::from_env();
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set for the outbox relay")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PostgresOutboxStore::new(pool));
    store
        .ensure_schema()
        .await
        .context("failed to prepare the outbox table")?;

    let broker = AmqpBroker::new(&config.broker_url, format!("{}-relay", config.service_name));
    let connection = ConnectionManager::new(Arc::new(broker), config.connection());
    connection
        .connect()
        .await
        .context("failed to connect to the broker")?;

    let producer = EventProducer::new(connection.clone(), config.producer());
    let processor = Arc::new(OutboxProcessor::new(
        store.clone(),
        Arc::new(producer),
        config.outbox_processor(),
    ));
    let handle = processor.spawn();
    tracing::info!(service = %config.service_name, "outbox relay running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    handle.shutdown().await;
    let report = HealthCheck::new(&connection)
        .outbox(store.as_ref())
        .report()
        .await?;
    tracing::info!(health = %report.to_json()?, "outbox relay stopped");
    connection.disconnect().await;
    Ok(())
}
