//! Stream publisher.
//!
//! Seals a `NewEvent` into an envelope and appends it with retries. Each
//! attempt appends a record tagged with its attempt number; a failed append
//! leaves nothing behind, so at most one record per publish call lands in the
//! stream. Every attempt fetches the handle from the connection manager, so a
//! reconnect in progress elsewhere only costs an attempt. When every attempt
//! fails the envelope is archived to the dead-letter stream (best effort) and
//! the caller gets `PublishError`.

use std::sync::Arc;

use tracing::{error, info, instrument};

use agilebus_core::EventId;
use agilebus_events::codec::FIELD_ATTEMPT;
use agilebus_events::{EventEnvelope, NewEvent, encode_record};

use crate::broker::BrokerError;
use crate::connection::ConnectionManager;
use crate::dead_letter::DeadLetterStore;
use crate::error::PublishError;
use crate::retry::{RetryPolicy, retry};

#[derive(Debug, Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    dead_letters: DeadLetterStore,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, retry: RetryPolicy) -> Self {
        let dead_letters = DeadLetterStore::new(connection.topology().dlq_stream.clone());
        Self {
            connection,
            dead_letters,
            retry,
        }
    }

    /// Publish one event; returns its id once the append is acknowledged by the broker.
    #[instrument(
        skip(self, event),
        fields(event_type = %event.event_type, priority = %event.priority),
        err
    )]
    pub async fn publish(&self, event: NewEvent) -> Result<EventId, PublishError> {
        self.connection.ensure_open()?;
        let envelope = EventEnvelope::new(event);
        let connection = &self.connection;
        let stream = &connection.topology().stream;

        let base = encode_record(&envelope, 1)?;

        let appended = retry(&self.retry, "publish", |attempt| {
            let mut fields = base.clone();
            fields.insert(FIELD_ATTEMPT.to_string(), attempt.to_string());
            async move {
                let broker = connection
                    .broker()
                    .await
                    .map_err(|e| BrokerError::Connection(e.to_string()))?;
                broker.append(stream, &fields).await
            }
        })
        .await;

        match appended {
            Ok(message_id) => {
                info!(event_id = %envelope.id(), %message_id, "event published");
                Ok(envelope.id())
            }
            Err(exhausted) => {
                let reason = exhausted.last_error.to_string();
                let archived = match self.connection.broker().await {
                    Ok(broker) => self
                        .dead_letters
                        .record_failed_event(broker.as_ref(), &envelope, &reason, exhausted.attempts)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(BrokerError::Connection(e.to_string())),
                };
                if let Err(e) = archived {
                    error!(
                        event_id = %envelope.id(),
                        error = %e,
                        "could not archive unpublished event"
                    );
                }
                Err(PublishError::Exhausted {
                    event_id: envelope.id(),
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                })
            }
        }
    }

    /// Publish from wire strings; rejects unknown type or priority before any append.
    pub async fn publish_raw(
        &self,
        event_type: &str,
        data: serde_json::Value,
        priority: Option<&str>,
        source: Option<String>,
        target: Option<String>,
    ) -> Result<EventId, PublishError> {
        let event = NewEvent::parse(event_type, data, priority, source, target)?;
        self.publish(event).await
    }
}
