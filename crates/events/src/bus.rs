//! Publishing abstraction handed to collaborators.
//!
//! Producers (the hub's HTTP layer, role agents, webhook handlers) depend on
//! this trait instead of a concrete bus, so the bus is injected by the process
//! bootstrap rather than reached through global state.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a record may be handled more than once; handlers must
//!   be idempotent on the envelope `id`.
//! - **Per-producer order**: appends from one producer land in the stream in
//!   call order. Consumers scaled out in one group see no global order.
//! - **Synchronous failure**: `publish` only errors after the bus has given
//!   up retrying; callers that retry the whole call get a new envelope id.

use std::sync::Arc;

use async_trait::async_trait;

use agilebus_core::EventId;

use crate::envelope::NewEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn publish(&self, event: NewEvent) -> Result<EventId, Self::Error>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    type Error = P::Error;

    async fn publish(&self, event: NewEvent) -> Result<EventId, Self::Error> {
        (**self).publish(event).await
    }
}
