use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use agilebus_core::{DomainError, DomainResult, EventId};

use crate::event_type::{EventPriority, EventType};

/// Opaque producer payload. The bus never inspects its shape.
pub type EventData = Map<String, JsonValue>;

/// Envelope schema version written by this bus.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Envelope for an event, as appended to the stream.
///
/// Notes:
/// - **Immutable**: built once by the publisher, never mutated afterwards.
/// - `id` and `timestamp` are assigned at construction, not by the producer.
/// - `priority` is advisory metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: EventId,
    #[serde(rename = "type")]
    event_type: EventType,
    data: EventData,
    priority: EventPriority,
    source: Option<String>,
    target: Option<String>,
    timestamp: DateTime<Utc>,
    version: String,
}

impl EventEnvelope {
    /// Seal a producer request into an envelope with a fresh id and the current UTC time.
    pub fn new(event: NewEvent) -> Self {
        Self::from_parts(EventId::new(), Utc::now(), event)
    }

    pub fn from_parts(id: EventId, timestamp: DateTime<Utc>, event: NewEvent) -> Self {
        Self {
            id,
            event_type: event.event_type,
            data: event.data,
            priority: event.priority,
            source: event.source,
            target: event.target,
            timestamp,
            version: ENVELOPE_VERSION.to_string(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn priority(&self) -> EventPriority {
        self.priority
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

/// A producer's request to publish, before the bus assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub data: EventData,
    pub priority: EventPriority,
    pub source: Option<String>,
    pub target: Option<String>,
}

impl NewEvent {
    pub fn new(event_type: EventType, data: EventData) -> Self {
        Self {
            event_type,
            data,
            priority: EventPriority::default(),
            source: None,
            target: None,
        }
    }

    /// Build from an arbitrary JSON value; only objects are accepted as payloads.
    pub fn from_value(event_type: EventType, data: JsonValue) -> DomainResult<Self> {
        match data {
            JsonValue::Object(map) => Ok(Self::new(event_type, map)),
            other => Err(DomainError::validation(format!(
                "event data must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Build from untyped wire strings (e.g. an HTTP request body).
    ///
    /// Unknown `event_type` or `priority` values are rejected; a missing
    /// priority falls back to `normal`.
    pub fn parse(
        event_type: &str,
        data: JsonValue,
        priority: Option<&str>,
        source: Option<String>,
        target: Option<String>,
    ) -> DomainResult<Self> {
        let event_type: EventType = event_type.parse()?;
        let priority = match priority {
            Some(p) => p.parse()?,
            None => EventPriority::default(),
        };

        let mut event = Self::from_value(event_type, data)?.with_priority(priority);
        event.source = source;
        event.target = target;
        Ok(event)
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
