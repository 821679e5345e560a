//! Read-only queries over the streams.
//!
//! Every query is a point-in-time snapshot; nothing here claims or
//! acknowledges records.

use serde::Serialize;
use tracing::warn;

use agilebus_events::codec::FIELD_TYPE;
use agilebus_events::{EventEnvelope, EventPriority, EventType, decode_record};

use crate::broker::{BrokerError, StreamBroker};

const MIN_PAGE: usize = 32;

/// A decoded record from the main stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub message_id: String,
    pub envelope: EventEnvelope,
}

/// Most recent envelopes, newest first, optionally restricted to one type.
///
/// Pages backwards through the stream until `limit` matches are found or the
/// stream is exhausted. The indexed `type` field is checked before decoding;
/// undecodable records are skipped.
pub async fn event_history(
    broker: &dyn StreamBroker,
    stream: &str,
    event_type: Option<EventType>,
    limit: usize,
) -> Result<Vec<HistoryEntry>, BrokerError> {
    let mut found = Vec::new();
    if limit == 0 {
        return Ok(found);
    }

    let page = limit.max(MIN_PAGE);
    let mut before: Option<String> = None;

    loop {
        let entries = broker.rev_range(stream, before.as_deref(), page).await?;
        let exhausted = entries.len() < page;
        before = entries.last().map(|e| e.id.clone());

        for entry in entries {
            if let Some(wanted) = event_type {
                if entry.fields.get(FIELD_TYPE).map(String::as_str) != Some(wanted.as_str()) {
                    continue;
                }
            }

            match decode_record(&entry.fields) {
                Ok(envelope) => {
                    found.push(HistoryEntry {
                        message_id: entry.id,
                        envelope,
                    });
                    if found.len() == limit {
                        return Ok(found);
                    }
                }
                Err(e) => warn!(message_id = %entry.id, error = %e, "skipping undecodable record"),
            }
        }

        if exhausted || before.is_none() {
            return Ok(found);
        }
    }
}

/// Wire names of every event type.
pub fn event_types() -> Vec<&'static str> {
    EventType::ALL.iter().map(EventType::as_str).collect()
}

/// Wire names of every priority.
pub fn priorities() -> Vec<&'static str> {
    EventPriority::ALL.iter().map(EventPriority::as_str).collect()
}
