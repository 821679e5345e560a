//! Subscription registry: event type → ordered handler list.
//!
//! Lookup is by the closed `EventType` enum, resolved at registration time.
//! The registry is a plain value owned by one consumer loop; it is mutated only
//! through `&mut self` before or between runs, never while dispatching.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::error;

use crate::envelope::EventEnvelope;
use crate::event_type::EventType;
use crate::handler::SharedHandler;

/// Outcome of dispatching one envelope to its handlers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that were called.
    pub invoked: usize,
    /// Handlers that returned an error.
    pub failed: usize,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.invoked - self.failed
    }
}

#[derive(Default, Clone)]
pub struct SubscriptionRegistry {
    handlers: HashMap<EventType, Vec<SharedHandler>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for each of `event_types`, after any existing handlers.
    pub fn subscribe(&mut self, event_types: &[EventType], handler: SharedHandler) {
        for event_type in event_types {
            self.handlers
                .entry(*event_type)
                .or_default()
                .push(handler.clone());
        }
    }

    /// Remove `handler` from `event_type`. Returns whether it was registered.
    pub fn unsubscribe(&mut self, event_type: EventType, handler: &SharedHandler) -> bool {
        let Some(list) = self.handlers.get_mut(&event_type) else {
            return false;
        };

        let before = list.len();
        list.retain(|h| !Arc::ptr_eq(h, handler));
        let removed = list.len() != before;

        if list.is_empty() {
            self.handlers.remove(&event_type);
        }
        removed
    }

    pub fn handlers_for(&self, event_type: EventType) -> &[SharedHandler] {
        self.handlers
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn subscribed_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Call every handler registered for the envelope's type, in registration order.
    ///
    /// Handler errors are logged and counted, never propagated.
    pub async fn dispatch(&self, message_id: &str, envelope: &EventEnvelope) -> DispatchReport {
        let mut report = DispatchReport::default();

        for handler in self.handlers_for(envelope.event_type()) {
            report.invoked += 1;
            if let Err(err) = handler.handle(envelope).await {
                report.failed += 1;
                error!(
                    message_id,
                    event_id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    handler = handler.name(),
                    error = %err,
                    "event handler failed"
                );
            }
        }

        report
    }
}

impl core::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for t in self.subscribed_types() {
            let names: Vec<&str> = self.handlers_for(t).iter().map(|h| h.name()).collect();
            map.entry(&t, &names);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventData, NewEvent};
    use crate::handler::handler_fn;
    use std::sync::Mutex;

    fn envelope(t: EventType) -> EventEnvelope {
        EventEnvelope::new(NewEvent::new(t, EventData::new()))
    }

    #[tokio::test]
    async fn dispatch_follows_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = SubscriptionRegistry::new();

        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            registry.subscribe(
                &[EventType::WorkflowStarted],
                handler_fn(name, move |_| {
                    calls.lock().unwrap().push(name);
                    Ok(())
                }),
            );
        }

        let report = registry
            .dispatch("1-0", &envelope(EventType::WorkflowStarted))
            .await;
        assert_eq!(report, DispatchReport { invoked: 3, failed: 0 });
        assert_eq!(*calls.lock().unwrap(), ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_next_one() {
        let ran = Arc::new(Mutex::new(false));
        let mut registry = SubscriptionRegistry::new();

        registry.subscribe(
            &[EventType::GitPush],
            handler_fn("broken", |_| Err(anyhow::anyhow!("boom"))),
        );
        let flag = ran.clone();
        registry.subscribe(
            &[EventType::GitPush],
            handler_fn("healthy", move |_| {
                *flag.lock().unwrap() = true;
                Ok(())
            }),
        );

        let report = registry.dispatch("1-0", &envelope(EventType::GitPush)).await;
        assert_eq!(report.invoked, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded(), 1);
        assert!(*ran.lock().unwrap());
    }

    #[tokio::test]
    async fn unmatched_type_invokes_nothing() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(&[EventType::GitPush], handler_fn("push", |_| Ok(())));

        let report = registry
            .dispatch("1-0", &envelope(EventType::WellnessAlert))
            .await;
        assert_eq!(report, DispatchReport::default());
    }

    #[test]
    fn unsubscribe_removes_only_that_handler() {
        let mut registry = SubscriptionRegistry::new();
        let a = handler_fn("a", |_| Ok(()));
        let b = handler_fn("b", |_| Ok(()));
        registry.subscribe(&[EventType::AgentError, EventType::AgentCompleted], a.clone());
        registry.subscribe(&[EventType::AgentError], b.clone());

        assert!(registry.unsubscribe(EventType::AgentError, &a));
        assert!(!registry.unsubscribe(EventType::AgentError, &a));
        assert_eq!(registry.handlers_for(EventType::AgentError).len(), 1);
        assert_eq!(registry.handlers_for(EventType::AgentError)[0].name(), "b");
        assert_eq!(registry.handlers_for(EventType::AgentCompleted).len(), 1);

        assert!(registry.unsubscribe(EventType::AgentCompleted, &a));
        assert_eq!(registry.subscribed_types(), vec![EventType::AgentError]);
    }
}
