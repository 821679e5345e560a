//! Dead-letter stream access.

use chrono::Utc;
use tracing::{error, warn};

use agilebus_events::{EventEnvelope, FailedEvent, FailedMessage, FailedRecord, RecordFields};

use crate::broker::{BrokerError, StreamBroker};

/// One record read back from the dead-letter stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub entry_id: String,
    pub record: FailedRecord,
}

/// Appends to and lists the dead-letter stream.
#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    stream: String,
}

impl DeadLetterStore {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Archive an envelope whose publish attempts were all exhausted.
    pub async fn record_failed_event(
        &self,
        broker: &dyn StreamBroker,
        envelope: &EventEnvelope,
        error: &str,
        retry_count: u32,
    ) -> Result<String, BrokerError> {
        let record = FailedRecord::Event(FailedEvent {
            envelope: envelope.clone(),
            failed_at: Utc::now(),
            error: error.to_string(),
            retry_count,
        });
        let id = self.append(broker, &record).await?;
        warn!(
            event_id = %envelope.id(),
            retry_count,
            dlq_entry = %id,
            "event dead-lettered after failed publish"
        );
        Ok(id)
    }

    /// Archive a claimed record whose processing attempts were all exhausted.
    pub async fn record_failed_message(
        &self,
        broker: &dyn StreamBroker,
        message_id: &str,
        fields: &RecordFields,
        error: &str,
        retry_count: u32,
    ) -> Result<String, BrokerError> {
        let record = FailedRecord::Message(FailedMessage {
            message_id: message_id.to_string(),
            fields: fields.clone(),
            failed_at: Utc::now(),
            error: error.to_string(),
            retry_count,
        });
        let id = self.append(broker, &record).await?;
        warn!(
            message_id,
            retry_count,
            dlq_entry = %id,
            "message dead-lettered after failed processing"
        );
        Ok(id)
    }

    async fn append(
        &self,
        broker: &dyn StreamBroker,
        record: &FailedRecord,
    ) -> Result<String, BrokerError> {
        let fields = record
            .to_fields()
            .map_err(|e| BrokerError::Command(format!("failed to encode dead-letter record: {e}")))?;
        broker.append(&self.stream, &fields).await.inspect_err(|e| {
            error!(stream = %self.stream, error = %e, "dead-letter append failed");
        })
    }

    /// Most recent dead-letter records, newest first.
    ///
    /// Entries that are not failed-record documents are skipped, so fewer
    /// than `limit` may come back.
    pub async fn list(
        &self,
        broker: &dyn StreamBroker,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let entries = broker.rev_range(&self.stream, None, limit).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match FailedRecord::from_fields(&entry.fields) {
                Ok(record) => Some(DeadLetterEntry {
                    entry_id: entry.id,
                    record,
                }),
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "skipping unreadable dead-letter entry");
                    None
                }
            })
            .collect())
    }
}
