//! Broker connection lifecycle.
//!
//! The manager owns at most one live broker handle. `connect` dials with
//! backoff and sets up the topology (main stream + group, dead-letter stream +
//! group); `reconnect` swaps the handle after a transport failure. The lock
//! only guards the handle swap: publishers and consumers clone the `Arc` out
//! and run their commands without holding it.
//!
//! Between `connect` and `disconnect` the manager is *open*. While open, the
//! slot is never emptied ahead of a replacement; if a reconnect fails the
//! stale handle is dropped and the next `broker()` call dials again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::broker::{BrokerConnector, BrokerError, GroupSetup, StreamBroker};
use crate::config::BusConfig;
use crate::error::ConnectError;
use crate::retry::{retry, RetryPolicy};

/// Stream and group names the bus needs to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub stream: String,
    pub group: String,
    pub dlq_stream: String,
    pub dlq_group: String,
}

impl Topology {
    pub fn from_config(config: &BusConfig) -> Self {
        Self {
            stream: config.stream.clone(),
            group: config.group.clone(),
            dlq_stream: config.dlq_stream.clone(),
            dlq_group: config.dlq_group.clone(),
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    enabled: bool,
    connect_retry: RetryPolicy,
    reconnect_delay: Duration,
    open: AtomicBool,
    broker: RwLock<Option<Arc<dyn StreamBroker>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("topology", &self.topology)
            .field("enabled", &self.enabled)
            .field("open", &self.open.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(config: &BusConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            connector,
            topology: Topology::from_config(config),
            enabled: config.enabled,
            connect_retry: config.connect_retry.clone(),
            reconnect_delay: config.reconnect_delay,
            open: AtomicBool::new(false),
            broker: RwLock::new(None),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Connect and set up the topology.
    ///
    /// Safe to call repeatedly: existing groups are left untouched, and a
    /// previous handle is replaced.
    #[instrument(skip(self), fields(stream = %self.topology.stream), err)]
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if !self.enabled {
            return Err(ConnectError::Disabled);
        }

        let broker = retry(&self.connect_retry, "connect", |_| self.dial())
            .await
            .map_err(|e| ConnectError::Exhausted {
                attempts: e.attempts,
                source: e.last_error,
            })?;

        let previous = {
            let mut slot = self.broker.write().await;
            self.open.store(true, Ordering::SeqCst);
            slot.replace(broker)
        };
        if let Some(previous) = previous {
            previous.close().await;
        }
        info!(group = %self.topology.group, "event bus connected");
        Ok(())
    }

    async fn dial(&self) -> Result<Arc<dyn StreamBroker>, BrokerError> {
        let broker = self.connector.connect().await?;
        broker.ping().await?;

        let t = &self.topology;
        for (stream, group) in [(&t.stream, &t.group), (&t.dlq_stream, &t.dlq_group)] {
            if broker.ensure_group(stream, group).await? == GroupSetup::Created {
                info!(%stream, %group, "consumer group created");
            }
        }
        Ok(broker)
    }

    /// Drop the live handle, if any. Idempotent.
    pub async fn disconnect(&self) {
        let previous = {
            let mut slot = self.broker.write().await;
            self.open.store(false, Ordering::SeqCst);
            slot.take()
        };
        if let Some(broker) = previous {
            broker.close().await;
            info!("event bus disconnected");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.broker.read().await.is_some()
    }

    /// Fail fast when `connect` was never called, or `disconnect` was.
    pub fn ensure_open(&self) -> Result<(), ConnectError> {
        if !self.enabled {
            return Err(ConnectError::Disabled);
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectError::NotConnected);
        }
        Ok(())
    }

    /// The live handle.
    ///
    /// Returns `NotConnected` outside `connect`/`disconnect`. While open but
    /// without a handle (a reconnect failed), dials once and installs the result.
    pub async fn broker(&self) -> Result<Arc<dyn StreamBroker>, ConnectError> {
        if let Some(broker) = self.broker.read().await.clone() {
            return Ok(broker);
        }
        self.ensure_open()?;

        let dialed = self.dial().await.map_err(ConnectError::Dial)?;
        let installed = {
            let mut slot = self.broker.write().await;
            if !self.open.load(Ordering::SeqCst) {
                Err(ConnectError::NotConnected)
            } else if let Some(existing) = slot.as_ref() {
                Ok(Some(existing.clone()))
            } else {
                *slot = Some(dialed.clone());
                Ok(None)
            }
        };
        match installed {
            Ok(None) => {
                info!("event bus reconnected on demand");
                Ok(dialed)
            }
            Ok(Some(existing)) => {
                dialed.close().await;
                Ok(existing)
            }
            Err(e) => {
                dialed.close().await;
                Err(e)
            }
        }
    }

    /// Wait `reconnect_delay`, then connect again.
    ///
    /// The previous handle stays installed until the new one replaces it. On
    /// failure it is dropped so `is_connected` reports the outage.
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        warn!(delay_ms = self.reconnect_delay.as_millis() as u64, "reconnecting to broker");
        tokio::time::sleep(self.reconnect_delay).await;
        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let stale = self.broker.write().await.take();
                if let Some(stale) = stale {
                    stale.close().await;
                }
                Err(e)
            }
        }
    }

    /// Connect lazily, or ping the live handle and reconnect when it fails.
    pub async fn health_check(&self) -> Result<(), ConnectError> {
        let current = self.broker.read().await.clone();
        match current {
            None => self.connect().await,
            Some(broker) => match broker.ping().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(error = %e, "broker health check failed");
                    self.reconnect().await
                }
            },
        }
    }
}
