use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::EventEnvelope;

/// Error returned by a handler. Handlers are external collaborators, so any
/// error type is accepted.
pub type HandlerError = anyhow::Error;

/// Shared handler reference as stored in the subscription registry.
pub type SharedHandler = Arc<dyn EventHandler>;

/// Reacts to delivered envelopes (handler abstraction).
///
/// ## Failure semantics
///
/// A handler error is logged and counted by the consumer, then ignored: the
/// record is still acknowledged and the remaining handlers for the same record
/// still run. Redelivering would not fix a defect in the handler itself.
///
/// ## Idempotency
///
/// Delivery is at-least-once, so handlers must tolerate seeing the same
/// envelope `id` more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapter turning a synchronous closure into an `EventHandler`.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&EventEnvelope) -> Result<(), HandlerError> + Send + Sync,
{
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        (self.f)(envelope)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a closure as a shared handler.
pub fn handler_fn<F>(name: impl Into<String>, f: F) -> SharedHandler
where
    F: Fn(&EventEnvelope) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}
