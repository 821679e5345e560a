//! Dead-letter record types.
//!
//! A dead-letter entry is either a *failed event* (publishing never succeeded)
//! or a *failed message* (a claimed record exhausted its processing retries).
//! Each is stored as JSON under a single field whose name tells them apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, RecordFields};
use crate::envelope::EventEnvelope;

pub const FIELD_FAILED_EVENT: &str = "failed_event";
pub const FIELD_FAILED_MESSAGE: &str = "failed_message";

/// An envelope whose every append attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    pub failed_at: DateTime<Utc>,
    pub error: String,
    pub retry_count: u32,
}

/// A stream record that could not be processed after all retries.
///
/// Keeps the raw fields rather than an envelope, since decoding is usually
/// what failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedMessage {
    pub message_id: String,
    pub fields: RecordFields,
    pub failed_at: DateTime<Utc>,
    pub error: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailedRecord {
    Event(FailedEvent),
    Message(FailedMessage),
}

impl FailedRecord {
    /// Encode into the fields appended to the dead-letter stream.
    pub fn to_fields(&self) -> Result<RecordFields, CodecError> {
        let (key, json) = match self {
            FailedRecord::Event(e) => (FIELD_FAILED_EVENT, serde_json::to_string(e)),
            FailedRecord::Message(m) => (FIELD_FAILED_MESSAGE, serde_json::to_string(m)),
        };

        let mut fields = RecordFields::new();
        fields.insert(key.to_string(), json.map_err(CodecError::Encode)?);
        Ok(fields)
    }

    /// Decode a dead-letter stream record.
    pub fn from_fields(fields: &RecordFields) -> Result<Self, CodecError> {
        if let Some(raw) = fields.get(FIELD_FAILED_EVENT) {
            let event = serde_json::from_str(raw).map_err(CodecError::InvalidEnvelope)?;
            return Ok(FailedRecord::Event(event));
        }
        if let Some(raw) = fields.get(FIELD_FAILED_MESSAGE) {
            let message = serde_json::from_str(raw).map_err(CodecError::InvalidEnvelope)?;
            return Ok(FailedRecord::Message(message));
        }
        Err(CodecError::MissingField(FIELD_FAILED_EVENT))
    }
}
