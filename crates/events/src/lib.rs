//! Event envelope, wire codec and dispatch mechanics (no IO).
//!
//! The async broker plumbing lives in `agilebus-infra`; this crate only knows
//! how an event looks on the wire and how it reaches its handlers.

pub mod bus;
pub mod codec;
pub mod envelope;
pub mod event_type;
pub mod failure;
pub mod handler;
pub mod registry;

pub use bus::EventPublisher;
pub use codec::{CodecError, RecordFields, decode_record, encode_record, record_attempt};
pub use envelope::{ENVELOPE_VERSION, EventData, EventEnvelope, NewEvent};
pub use event_type::{EventPriority, EventType};
pub use failure::{FailedEvent, FailedMessage, FailedRecord};
pub use handler::{EventHandler, FnHandler, HandlerError, SharedHandler, handler_fn};
pub use registry::{DispatchReport, SubscriptionRegistry};
