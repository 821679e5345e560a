//! Async event bus over a durable stream broker.
//!
//! - `broker`: broker boundary, in-memory and Redis Streams implementations
//! - `connection`: connect/reconnect lifecycle and topology setup
//! - `publisher` / `consumer`: the two halves of delivery
//! - `dead_letter` / `introspection`: read and archive paths
//! - `bus`: the `EventBus` service object tying them together

pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod introspection;
pub mod publisher;
pub mod retry;

#[cfg(test)]
mod integration_tests;

pub use broker::{BrokerConnector, BrokerError, InMemoryBroker, InMemoryConnector, StreamBroker, StreamStats};
#[cfg(feature = "redis")]
pub use broker::{RedisConnector, RedisStreamBroker};
pub use bus::EventBus;
pub use config::BusConfig;
pub use connection::ConnectionManager;
pub use consumer::{Consumer, ConsumerHandle, ConsumerStats, StopSignal};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore};
pub use error::{ConfigError, ConnectError, ProcessError, PublishError, QueryError};
pub use introspection::HistoryEntry;
pub use publisher::Publisher;
pub use retry::{RetryExhausted, RetryPolicy};
