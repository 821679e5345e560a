//! Error types per bus stage.

use thiserror::Error;

use agilebus_core::{DomainError, EventId};
use agilebus_events::CodecError;

use crate::broker::BrokerError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value for {var}: {value:?} ({reason})")]
    Env {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Establishing the broker connection failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("event bus is disabled by configuration")]
    Disabled,

    #[error("event bus is not connected")]
    NotConnected,

    #[error("could not reach broker: {0}")]
    Dial(#[source] BrokerError),

    #[error("could not connect to broker after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

/// A publish call failed; the caller should treat the event as not sent.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] DomainError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] CodecError),

    #[error("event {event_id} not published after {attempts} attempt(s): {source}")]
    Exhausted {
        event_id: EventId,
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

/// One processing attempt of a claimed record failed.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("undecodable record: {0}")]
    Decode(#[from] CodecError),
}

/// A read-only introspection query failed.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
