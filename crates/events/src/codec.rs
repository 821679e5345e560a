//! Stream-record codec.
//!
//! A stream record holds the serialized envelope under `event` plus redundant
//! indexed fields (`type`, `priority`, `source`, `target`, `attempt`) so the
//! broker can filter without deserializing the payload.
//!
//! Brokers hand records over as `RecordFields` (UTF-8 strings); `decode_record`
//! is the only place that turns that wire form into an `EventEnvelope`.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::envelope::EventEnvelope;
use crate::event_type::EventType;

/// Field map of a single stream record, already decoded to strings.
pub type RecordFields = BTreeMap<String, String>;

pub const FIELD_EVENT: &str = "event";
pub const FIELD_TYPE: &str = "type";
pub const FIELD_PRIORITY: &str = "priority";
pub const FIELD_SOURCE: &str = "source";
pub const FIELD_TARGET: &str = "target";
pub const FIELD_ATTEMPT: &str = "attempt";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record is missing field `{0}`")]
    MissingField(&'static str),

    #[error("unknown event type {0:?}")]
    UnknownEventType(String),

    #[error("indexed type {indexed} does not match envelope type {envelope}")]
    TypeMismatch { indexed: EventType, envelope: EventType },

    #[error("invalid envelope json: {0}")]
    InvalidEnvelope(#[source] serde_json::Error),

    #[error("failed to encode: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Encode an envelope into the fields appended for one publish attempt.
pub fn encode_record(envelope: &EventEnvelope, attempt: u32) -> Result<RecordFields, CodecError> {
    let event = serde_json::to_string(envelope).map_err(CodecError::Encode)?;

    let mut fields = RecordFields::new();
    fields.insert(FIELD_EVENT.to_string(), event);
    fields.insert(FIELD_TYPE.to_string(), envelope.event_type().as_str().to_string());
    fields.insert(FIELD_PRIORITY.to_string(), envelope.priority().as_str().to_string());
    fields.insert(
        FIELD_SOURCE.to_string(),
        envelope.source().unwrap_or_default().to_string(),
    );
    fields.insert(
        FIELD_TARGET.to_string(),
        envelope.target().unwrap_or_default().to_string(),
    );
    fields.insert(FIELD_ATTEMPT.to_string(), attempt.to_string());
    Ok(fields)
}

/// Decode a stream record back into its envelope.
///
/// The indexed `type` field must name a known event type and agree with the
/// type inside the serialized envelope.
pub fn decode_record(fields: &RecordFields) -> Result<EventEnvelope, CodecError> {
    let indexed = fields
        .get(FIELD_TYPE)
        .filter(|t| !t.is_empty())
        .ok_or(CodecError::MissingField(FIELD_TYPE))?;
    let indexed: EventType = indexed
        .parse()
        .map_err(|_| CodecError::UnknownEventType(indexed.clone()))?;

    let raw = fields
        .get(FIELD_EVENT)
        .ok_or(CodecError::MissingField(FIELD_EVENT))?;
    let envelope: EventEnvelope = serde_json::from_str(raw).map_err(CodecError::InvalidEnvelope)?;

    if envelope.event_type() != indexed {
        return Err(CodecError::TypeMismatch {
            indexed,
            envelope: envelope.event_type(),
        });
    }

    Ok(envelope)
}

/// Publish attempt recorded with the record, if present and numeric.
pub fn record_attempt(fields: &RecordFields) -> Option<u32> {
    fields.get(FIELD_ATTEMPT).and_then(|a| a.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::NewEvent;
    use crate::event_type::EventPriority;
    use serde_json::json;

    fn sample() -> EventEnvelope {
        let event = NewEvent::from_value(
            EventType::AgentHeartbeat,
            json!({"status": "active", "load": 0.25, "tags": ["po", "sm"]}),
        )
        .unwrap()
        .with_priority(EventPriority::High)
        .with_source("po-agent");
        EventEnvelope::new(event)
    }

    #[test]
    fn decode_restores_the_encoded_envelope() {
        let env = sample();
        let fields = encode_record(&env, 2).unwrap();

        assert_eq!(fields[FIELD_TYPE], "agent.heartbeat");
        assert_eq!(fields[FIELD_PRIORITY], "high");
        assert_eq!(fields[FIELD_SOURCE], "po-agent");
        assert_eq!(fields[FIELD_TARGET], "");
        assert_eq!(record_attempt(&fields), Some(2));

        let decoded = decode_record(&fields).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn serialized_envelope_is_byte_stable() {
        let env = sample();
        let first = encode_record(&env, 1).unwrap();
        let decoded = decode_record(&first).unwrap();
        let second = encode_record(&decoded, 1).unwrap();
        assert_eq!(first[FIELD_EVENT], second[FIELD_EVENT]);
    }

    #[test]
    fn missing_type_is_a_decode_error() {
        let mut fields = encode_record(&sample(), 1).unwrap();
        fields.remove(FIELD_TYPE);
        assert!(matches!(
            decode_record(&fields),
            Err(CodecError::MissingField(FIELD_TYPE))
        ));
    }

    #[test]
    fn unknown_indexed_type_is_a_decode_error() {
        let mut fields = encode_record(&sample(), 1).unwrap();
        fields.insert(FIELD_TYPE.to_string(), "agent.reborn".to_string());
        assert!(matches!(
            decode_record(&fields),
            Err(CodecError::UnknownEventType(t)) if t == "agent.reborn"
        ));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let mut fields = encode_record(&sample(), 1).unwrap();
        fields.insert(FIELD_EVENT.to_string(), "{\"id\": ".to_string());
        assert!(matches!(
            decode_record(&fields),
            Err(CodecError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn unknown_type_inside_envelope_is_a_decode_error() {
        let mut fields = encode_record(&sample(), 1).unwrap();
        let patched = fields[FIELD_EVENT].replace("agent.heartbeat", "agent.nap");
        fields.insert(FIELD_EVENT.to_string(), patched);
        assert!(matches!(
            decode_record(&fields),
            Err(CodecError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn indexed_type_must_agree_with_envelope() {
        let mut fields = encode_record(&sample(), 1).unwrap();
        fields.insert(FIELD_TYPE.to_string(), "git.push".to_string());
        assert!(matches!(
            decode_record(&fields),
            Err(CodecError::TypeMismatch {
                indexed: EventType::GitPush,
                envelope: EventType::AgentHeartbeat
            })
        ));
    }
}
