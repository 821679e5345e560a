//! `EventBus`: the service object handed to the process bootstrap.
//!
//! ```text
//! let bus = EventBus::new(BusConfig::from_env()?, connector)?;
//! bus.connect().await?;
//!
//! let mut consumer = bus.subscribe(&[EventType::GitPush], handler, None);
//! let handle = consumer.spawn();
//!
//! bus.publish(NewEvent::new(EventType::GitPush, data)).await?;
//! ```
//!
//! The bus is cheap to share behind an `Arc`; every consumer it creates shares
//! its connection manager.

use std::sync::Arc;

use async_trait::async_trait;

use agilebus_core::EventId;
use agilebus_events::{EventPublisher, EventType, NewEvent, SharedHandler};

use crate::broker::{BrokerConnector, StreamStats};
use crate::config::BusConfig;
use crate::connection::ConnectionManager;
use crate::consumer::Consumer;
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::error::{ConfigError, ConnectError, PublishError, QueryError};
use crate::introspection::{self, HistoryEntry};
use crate::publisher::Publisher;

#[derive(Debug)]
pub struct EventBus {
    config: BusConfig,
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    dead_letters: DeadLetterStore,
}

impl EventBus {
    /// Validates `config`; nothing is dialed until `connect`.
    pub fn new(config: BusConfig, connector: Arc<dyn BrokerConnector>) -> Result<Self, ConfigError> {
        config.validate()?;
        let connection = Arc::new(ConnectionManager::new(&config, connector));
        let publisher = Publisher::new(connection.clone(), config.retry.clone());
        let dead_letters = DeadLetterStore::new(config.dlq_stream.clone());
        Ok(Self {
            config,
            connection,
            publisher,
            dead_letters,
        })
    }

    /// Bus backed by Redis Streams at `config.redis_url`.
    #[cfg(feature = "redis")]
    pub fn redis(config: BusConfig) -> Result<Self, ConfigError> {
        let connector = crate::broker::RedisConnector::new(&config.redis_url)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::new(config, Arc::new(connector))
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Connect if needed, otherwise ping and reconnect on failure.
    pub async fn health_check(&self) -> Result<(), ConnectError> {
        self.connection.health_check().await
    }

    pub async fn publish(&self, event: NewEvent) -> Result<EventId, PublishError> {
        self.publisher.publish(event).await
    }

    /// Publish from wire strings (e.g. an HTTP request body).
    pub async fn publish_raw(
        &self,
        event_type: &str,
        data: serde_json::Value,
        priority: Option<&str>,
        source: Option<String>,
        target: Option<String>,
    ) -> Result<EventId, PublishError> {
        self.publisher
            .publish_raw(event_type, data, priority, source, target)
            .await
    }

    /// New consumer identity with `handler` registered for `event_types`.
    ///
    /// The consumer does nothing until it is `run` or `spawn`ed.
    pub fn subscribe(
        &self,
        event_types: &[EventType],
        handler: SharedHandler,
        consumer_name: Option<String>,
    ) -> Consumer {
        let mut consumer = self.consumer(consumer_name);
        consumer.subscribe(event_types, handler);
        consumer
    }

    /// New consumer identity with no subscriptions yet.
    pub fn consumer(&self, consumer_name: Option<String>) -> Consumer {
        Consumer::new(self.connection.clone(), self.config.clone(), consumer_name)
    }

    pub async fn get_event_history(
        &self,
        event_type: Option<EventType>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, QueryError> {
        let broker = self.connection.broker().await?;
        Ok(introspection::event_history(broker.as_ref(), &self.config.stream, event_type, limit).await?)
    }

    pub async fn get_stream_info(&self) -> Result<StreamStats, QueryError> {
        let broker = self.connection.broker().await?;
        Ok(broker.stream_stats(&self.config.stream).await?)
    }

    /// Most recent dead-letter records, newest first.
    pub async fn get_failed_events(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueryError> {
        let broker = self.connection.broker().await?;
        Ok(self.dead_letters.list(broker.as_ref(), limit).await?)
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        introspection::event_types()
    }

    pub fn priorities(&self) -> Vec<&'static str> {
        introspection::priorities()
    }
}

#[async_trait]
impl EventPublisher for EventBus {
    type Error = PublishError;

    async fn publish(&self, event: NewEvent) -> Result<EventId, PublishError> {
        self.publisher.publish(event).await
    }
}
