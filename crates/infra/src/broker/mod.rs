//! Durable log broker boundary.
//!
//! The bus only needs a handful of atomic primitives from its broker: append,
//! claim-with-group, acknowledge, reverse range and a few stats. Correctness
//! relies entirely on these being atomic at the broker; nothing above this
//! module keeps its own delivery state.
//!
//! Implementations:
//! - [`InMemoryBroker`]: consumer-group semantics in process, for tests and dev
//! - `RedisStreamBroker` (feature `redis`): Redis Streams

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use agilebus_events::RecordFields;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::{InMemoryBroker, InMemoryConnector};
#[cfg(feature = "redis")]
pub use redis_streams::{RedisConnector, RedisStreamBroker};

/// Broker operation error.
///
/// `Connection` errors are transient transport failures that warrant a
/// reconnect; `Command` errors are rejections by a live broker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),
}

impl BrokerError {
    pub fn is_connection(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

/// One record read from a stream, fields already decoded to strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: RecordFields,
}

/// Result of an idempotent consumer-group setup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupSetup {
    Created,
    AlreadyExists,
}

/// Which part of the group's log a read claims from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadFrom {
    /// Records never delivered to any consumer of the group.
    New,
    /// Records already delivered to this consumer but not yet acknowledged.
    Pending,
}

/// Read-only statistics of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub stream_name: String,
    pub length: u64,
    pub groups: u64,
    pub consumers: u64,
}

/// A live broker handle, shared by the publisher and every consumer loop.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Create `group` on `stream` (creating the stream if needed).
    ///
    /// An existing group is not an error.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<GroupSetup, BrokerError>;

    /// Append a record; returns the broker-assigned entry id.
    async fn append(&self, stream: &str, fields: &RecordFields) -> Result<String, BrokerError>;

    /// Acknowledge entries for `group`; returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError>;

    /// Newest-first entries strictly older than `before` (or from the tip when `None`).
    async fn rev_range(
        &self,
        stream: &str,
        before: Option<&str>,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    async fn stream_stats(&self, stream: &str) -> Result<StreamStats, BrokerError>;

    /// Open a reader for one consumer loop.
    ///
    /// Blocking reads go through their own reader so they never stall
    /// appends made on the shared handle.
    async fn reader(&self) -> Result<Box<dyn GroupReader>, BrokerError>;

    /// Release resources held by this handle. Safe to call more than once.
    async fn close(&self);
}

/// Claims records on behalf of one consumer identity.
#[async_trait]
pub trait GroupReader: Send {
    /// Claim up to `count` records, waiting at most `block` for new ones.
    ///
    /// Returns an empty batch on timeout.
    async fn read(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BrokerError>;
}

/// Dials the broker and produces a live handle.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StreamBroker>, BrokerError>;
}
