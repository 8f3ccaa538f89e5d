//! The dispatch delegate (spec §4.D): an in-process, type-indexed registry
//! of handler instances. Handlers are indexed by the `class_name` they were
//! registered for; dispatch decodes `event_json` once per matching handler
//! and invokes them sequentially in registration order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use qbus_core::EventBusError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

/// A typed handler for one event payload type.
///
/// `handle` returning `Err` does not stop sibling handlers from running;
/// [`DispatchDelegate::dispatch`] surfaces only the first underlying cause
/// (spec §4.D).
#[async_trait]
pub trait EventHandler<E>: Send + Sync {
    async fn handle(&self, event: &E) -> Result<(), EventBusError>;
}

/// Type-erased form of [`EventHandler`], so the registry can hold handlers
/// for many distinct event types behind one `class_name`-keyed map.
#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn dispatch(&self, json: &Value) -> Result<(), EventBusError>;
}

struct TypedHandlerAdapter<E, H> {
    handler: Arc<H>,
    _marker: std::marker::PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for TypedHandlerAdapter<E, H>
where
    E: DeserializeOwned + Send + Sync + 'static,
    H: EventHandler<E> + 'static,
{
    async fn dispatch(&self, json: &Value) -> Result<(), EventBusError> {
        let event: E = serde_json::from_value(json.clone())
            .map_err(|e| EventBusError::Decode(e.to_string()))?;
        self.handler.handle(&event).await
    }
}

/// Opaque handle returned by [`DispatchDelegate::register`], used to
/// [`DispatchDelegate::unregister`] later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry {
    id: HandlerId,
    handler: Arc<dyn ErasedHandler>,
}

/// Outcome of dispatching one decoded event to its matching handlers.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub handlers_invoked: usize,
    pub first_failure: Option<EventBusError>,
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        self.first_failure.is_none()
    }
}

/// Thread-safe registry of handlers keyed by `class_name` (spec §4.D).
///
/// Registration is rare relative to dispatch, so the registry favors cheap
/// concurrent reads: a dispatch takes a snapshot of the matching handlers
/// under a read lock, then invokes them without holding the lock, so a
/// concurrent unregister cannot be observed mid-dispatch (spec §4.D,
/// "a handler unregistered before dispatch begins ... must not receive
/// that event").
#[derive(Default)]
pub struct DispatchDelegate {
    handlers: RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl DispatchDelegate {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `handler` for events published under `class_name`.
    /// Returns a [`HandlerId`] for later [`Self::unregister`].
    pub async fn register<E, H>(&self, class_name: impl Into<String>, handler: H) -> HandlerId
    where
        E: DeserializeOwned + Send + Sync + 'static,
        H: EventHandler<E> + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let adapter = TypedHandlerAdapter {
            handler: Arc::new(handler),
            _marker: std::marker::PhantomData,
        };

        let mut handlers = self.handlers.write().await;
        handlers
            .entry(class_name.into())
            .or_default()
            .push(Entry {
                id,
                handler: Arc::new(adapter),
            });
        id
    }

    /// Remove a previously registered handler. No-op if `id` is unknown
    /// (e.g. already unregistered).
    pub async fn unregister(&self, id: HandlerId) {
        let mut handlers = self.handlers.write().await;
        for entries in handlers.values_mut() {
            entries.retain(|e| e.id != id);
        }
        handlers.retain(|_, entries| !entries.is_empty());
    }

    /// Deliver `json` (tagged `class_name`) to every matching handler,
    /// sequentially in registration order. An unmatched `class_name` is a
    /// successful no-op dispatch (spec §4.D).
    pub async fn dispatch(&self, class_name: &str, json: &Value) -> DispatchOutcome {
        let snapshot: Vec<Arc<dyn ErasedHandler>> = {
            let handlers = self.handlers.read().await;
            match handlers.get(class_name) {
                Some(entries) => entries.iter().map(|e| e.handler.clone()).collect(),
                None => Vec::new(),
            }
        };

        let mut outcome = DispatchOutcome::default();
        for handler in &snapshot {
            outcome.handlers_invoked += 1;
            // All invocations run regardless of earlier failures; only the
            // first underlying cause is surfaced (spec §4.D).
            if let Err(e) = handler.dispatch(json).await {
                if outcome.first_failure.is_none() {
                    outcome.first_failure = Some(e);
                } else {
                    tracing::warn!(class_name, "handler failed after first cause already recorded");
                }
            }
        }

        outcome
    }

    pub async fn handler_count(&self, class_name: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(class_name)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        name: String,
    }

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler<Widget> for CountingHandler {
        async fn handle(&self, _event: &Widget) -> Result<(), EventBusError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler {
        message: &'static str,
    }

    #[async_trait]
    impl EventHandler<Widget> for FailingHandler {
        async fn handle(&self, _event: &Widget) -> Result<(), EventBusError> {
            Err(EventBusError::Handler(self.message.to_string()))
        }
    }

    struct OrderRecordingHandler {
        label: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventHandler<Widget> for OrderRecordingHandler {
        async fn handle(&self, _event: &Widget) -> Result<(), EventBusError> {
            self.order.lock().await.push(self.label);
            Ok(())
        }
    }

    fn widget_json() -> Value {
        serde_json::to_value(Widget {
            name: "gadget".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn unmatched_class_name_is_a_successful_no_op() {
        let delegate = DispatchDelegate::new();
        let outcome = delegate.dispatch("NoSuchEvent", &widget_json()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.handlers_invoked, 0);
    }

    #[tokio::test]
    async fn matching_handler_is_invoked() {
        let delegate = DispatchDelegate::new();
        let count = Arc::new(AtomicUsize::new(0));
        delegate
            .register::<Widget, _>(
                "Widget",
                CountingHandler {
                    count: count.clone(),
                },
            )
            .await;

        let outcome = delegate.dispatch("Widget", &widget_json()).await;
        assert!(outcome.is_success());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_handler_does_not_receive_subsequent_dispatch() {
        let delegate = DispatchDelegate::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = delegate
            .register::<Widget, _>(
                "Widget",
                CountingHandler {
                    count: count.clone(),
                },
            )
            .await;

        delegate.unregister(id).await;
        delegate.dispatch("Widget", &widget_json()).await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_handlers_run_even_after_an_earlier_one_fails() {
        let delegate = DispatchDelegate::new();
        let count = Arc::new(AtomicUsize::new(0));

        delegate
            .register::<Widget, _>("Widget", FailingHandler { message: "boom" })
            .await;
        delegate
            .register::<Widget, _>(
                "Widget",
                CountingHandler {
                    count: count.clone(),
                },
            )
            .await;

        let outcome = delegate.dispatch("Widget", &widget_json()).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.handlers_invoked, 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_underlying_cause_is_surfaced() {
        let delegate = DispatchDelegate::new();
        delegate
            .register::<Widget, _>("Widget", FailingHandler { message: "first" })
            .await;
        delegate
            .register::<Widget, _>("Widget", FailingHandler { message: "second" })
            .await;

        let outcome = delegate.dispatch("Widget", &widget_json()).await;
        match outcome.first_failure {
            Some(EventBusError::Handler(msg)) => assert_eq!(msg, "first"),
            other => panic!("expected Handler(\"first\"), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handlers_are_visited_in_registration_order() {
        let delegate = DispatchDelegate::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        delegate
            .register::<Widget, _>(
                "Widget",
                OrderRecordingHandler {
                    label: "first",
                    order: order.clone(),
                },
            )
            .await;
        delegate
            .register::<Widget, _>(
                "Widget",
                OrderRecordingHandler {
                    label: "second",
                    order: order.clone(),
                },
            )
            .await;

        delegate.dispatch("Widget", &widget_json()).await;

        assert_eq!(*order.lock().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn decode_failure_is_reported_as_handler_failure() {
        let delegate = DispatchDelegate::new();
        delegate
            .register::<Widget, _>("Widget", FailingHandler { message: "unused" })
            .await;

        let malformed = serde_json::json!({"not_a_widget_field": 1});
        let outcome = delegate.dispatch("Widget", &malformed).await;

        assert!(matches!(outcome.first_failure, Some(EventBusError::Decode(_))));
    }
}
