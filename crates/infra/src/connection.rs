//! Broker connection lifecycle.
//!
//! One [`ConnectionManager`] per process owns the broker connection. Cloning the
//! manager is cheap and shares the same connection.
//!
//! - `connect()` is idempotent and serialized: concurrent callers end up with the
//!   same connection
//! - a watcher task notices broker-side closes, waits `reconnect_delay` and makes one
//!   reconnect attempt
//! - `channel()` blocks through a dead-connection window for up to
//!   `max_reconnect_attempts` attempts, then fails with a retryable
//!   [`BrokerError::Connection`]
//! - channel failures only drop the affected channel (`discard_channel`)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, BrokerChannel, BrokerConnection, BrokerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Attempts a caller waits through before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Operator-facing connection health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub active_channels: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    broker: Arc<dyn Broker>,
    config: ConnectionConfig,
    /// Serializes connection establishment.
    connect_guard: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<dyn BrokerConnection>>>,
    channels: Mutex<HashMap<u64, Arc<dyn BrokerChannel>>>,
    closing: AtomicBool,
}

impl Inner {
    fn current(&self) -> MutexGuard<'_, Option<Arc<dyn BrokerConnection>>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn BrokerChannel>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn live_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.current().as_ref().filter(|c| c.is_open()).cloned()
    }
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                config,
                connect_guard: tokio::sync::Mutex::new(()),
                current: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.live_connection().is_some()
    }

    /// Return the live connection, establishing one if needed.
    #[instrument(skip(self), err)]
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.inner.closing.store(false, Ordering::SeqCst);
        self.try_connect().await
    }

    async fn try_connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let _guard = self.inner.connect_guard.lock().await;

        if let Some(conn) = self.inner.live_connection() {
            return Ok(conn);
        }
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let conn = self.inner.broker.connect().await?;
        *self.inner.current() = Some(conn.clone());
        info!("broker connection established");

        spawn_watcher(Arc::downgrade(&self.inner), conn.clone());
        Ok(conn)
    }

    /// Connect, waiting through up to `max_reconnect_attempts` failed attempts.
    async fn connection_with_retry(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let attempts = self.inner.config.max_reconnect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_connect().await {
                Ok(conn) => return Ok(conn),
                Err(BrokerError::Closed) => return Err(BrokerError::Closed),
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "broker connect failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.reconnect_delay).await;
                    }
                }
            }
        }

        Err(BrokerError::Connection(format!(
            "gave up after {attempts} connection attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Open a channel on the current connection and track it.
    #[instrument(skip(self), err)]
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let conn = self.connection_with_retry().await?;

        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(e) if e.is_connection_error() => {
                // The connection died under us; go through the reconnect window once.
                self.mark_dead(&conn);
                self.connection_with_retry().await?.create_channel().await?
            }
            Err(e) => return Err(e),
        };

        let mut channels = self.inner.channels();
        channels.retain(|_, c| c.is_open());
        channels.insert(channel.id(), channel.clone());
        debug!(channel_id = channel.id(), active = channels.len(), "channel opened");
        Ok(channel)
    }

    /// Stop tracking a failed channel and close it best-effort.
    pub async fn discard_channel(&self, channel: &Arc<dyn BrokerChannel>) {
        self.inner.channels().remove(&channel.id());
        if channel.is_open() {
            if let Err(e) = channel.close().await {
                debug!(channel_id = channel.id(), error = %e, "closing discarded channel failed");
            }
        }
    }

    /// Close every tracked channel, then the connection. Already-closed errors are
    /// ignored.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let _guard = self.inner.connect_guard.lock().await;

        let channels: Vec<_> = self.inner.channels().drain().map(|(_, c)| c).collect();
        for channel in channels {
            let _ = channel.close().await;
        }

        let conn = self.inner.current().take();
        if let Some(conn) = conn {
            let _ = conn.close().await;
        }
        info!("broker connection closed");
    }

    pub fn health(&self) -> ConnectionHealth {
        let status = if self.is_connected() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };
        let active_channels = self
            .inner
            .channels()
            .values()
            .filter(|c| c.is_open())
            .count();
        ConnectionHealth {
            status,
            active_channels,
        }
    }

    fn mark_dead(&self, conn: &Arc<dyn BrokerConnection>) {
        mark_dead(&self.inner, conn);
    }
}

fn mark_dead(inner: &Inner, conn: &Arc<dyn BrokerConnection>) {
    let mut current = inner.current();
    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
        *current = None;
        drop(current);
        inner.channels().clear();
    }
}

/// Watch one connection; on a broker-side close, schedule a single reconnect.
fn spawn_watcher(inner: Weak<Inner>, conn: Arc<dyn BrokerConnection>) {
    tokio::spawn(async move {
        conn.closed().await;

        let Some(strong) = inner.upgrade() else {
            return;
        };
        if strong.closing.load(Ordering::SeqCst) {
            return;
        }
        warn!("broker connection lost");
        mark_dead(&strong, &conn);

        let delay = strong.config.reconnect_delay;
        drop(strong);
        tokio::time::sleep(delay).await;

        let Some(strong) = inner.upgrade() else {
            return;
        };
        let manager = ConnectionManager { inner: strong };
        match manager.try_connect().await {
            Ok(_) => info!("broker connection re-established"),
            Err(e) => warn!(error = %e, "scheduled reconnect failed"),
        }
    });
}
