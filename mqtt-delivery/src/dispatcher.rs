//! Listener slots and synchronous event dispatch
//!
//! The dispatcher holds at most one listener per [`EventKind`]. It is driven
//! by the drain loop, so listeners run one at a time on the consumer's thread.
//! A listener that returns an error or panics never takes the drain loop down:
//! the failure is turned into an [`ErrorEvent`] and handed to the error
//! listener once.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::event::{ConnectionNotice, DeliveryEvent, ErrorEvent, EventKind, MessageEvent};

/// Error type listeners may return
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of every listener
pub type ListenerResult = std::result::Result<(), ListenerError>;

pub type MessageListener = Arc<dyn Fn(&MessageEvent) -> ListenerResult + Send + Sync>;
pub type ErrorListener = Arc<dyn Fn(&ErrorEvent) -> ListenerResult + Send + Sync>;
pub type ConnectionListener = Arc<dyn Fn(&ConnectionNotice) -> ListenerResult + Send + Sync>;

/// A listener bound to the slot of its event kind
#[derive(Clone)]
pub enum Listener {
    Message(MessageListener),
    Error(ErrorListener),
    Connection(ConnectionListener),
}

impl Listener {
    pub fn message<F>(f: F) -> Self
    where
        F: Fn(&MessageEvent) -> ListenerResult + Send + Sync + 'static,
    {
        Listener::Message(Arc::new(f))
    }

    pub fn error<F>(f: F) -> Self
    where
        F: Fn(&ErrorEvent) -> ListenerResult + Send + Sync + 'static,
    {
        Listener::Error(Arc::new(f))
    }

    pub fn connection<F>(f: F) -> Self
    where
        F: Fn(&ConnectionNotice) -> ListenerResult + Send + Sync + 'static,
    {
        Listener::Connection(Arc::new(f))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Listener::Message(_) => EventKind::Message,
            Listener::Error(_) => EventKind::Error,
            Listener::Connection(_) => EventKind::Connection,
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener({})", self.kind())
    }
}

/// What happened to a dispatched event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The listener ran and returned `Ok`
    Delivered,
    /// The slot was empty; the event was discarded
    NoListener,
    /// The listener failed; `reported` is true when the error listener
    /// accepted the resulting error event
    ListenerFailed { reported: bool },
}

#[derive(Default)]
struct Slots {
    message: RwLock<Option<MessageListener>>,
    error: RwLock<Option<ErrorListener>>,
    connection: RwLock<Option<ConnectionListener>>,
}

/// Routes delivery events to the registered listeners
///
/// Registration may happen from any thread, including from inside a running
/// listener. Each listener is cloned out of its slot before it is invoked, so
/// an event reaches exactly the listener that was registered when dispatch
/// started.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    slots: Arc<Slots>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `listener` into its slot; returns true when a previous listener was replaced
    pub fn set(&self, listener: Listener) -> bool {
        let kind = listener.kind();
        let replaced = match listener {
            Listener::Message(f) => self.slots.message.write().replace(f).is_some(),
            Listener::Error(f) => self.slots.error.write().replace(f).is_some(),
            Listener::Connection(f) => self.slots.connection.write().replace(f).is_some(),
        };

        tracing::debug!(
            "{} listener {}",
            kind,
            if replaced { "replaced" } else { "registered" }
        );
        replaced
    }

    pub fn set_message_listener<F>(&self, f: F) -> bool
    where
        F: Fn(&MessageEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.set(Listener::message(f))
    }

    pub fn set_error_listener<F>(&self, f: F) -> bool
    where
        F: Fn(&ErrorEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.set(Listener::error(f))
    }

    pub fn set_connection_listener<F>(&self, f: F) -> bool
    where
        F: Fn(&ConnectionNotice) -> ListenerResult + Send + Sync + 'static,
    {
        self.set(Listener::connection(f))
    }

    /// Empty the slot for `kind`; returns true when a listener was removed
    pub fn clear(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Message => self.slots.message.write().take().is_some(),
            EventKind::Error => self.slots.error.write().take().is_some(),
            EventKind::Connection => self.slots.connection.write().take().is_some(),
        }
    }

    pub fn has_listener(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Message => self.slots.message.read().is_some(),
            EventKind::Error => self.slots.error.read().is_some(),
            EventKind::Connection => self.slots.connection.read().is_some(),
        }
    }

    /// Invoke the listener for `event` on the calling thread
    pub fn dispatch(&self, event: &DeliveryEvent) -> DispatchOutcome {
        let kind = event.listener_kind();
        let result = match event {
            DeliveryEvent::Message(message) => {
                let listener = self.slots.message.read().clone();
                listener.map(|f| invoke(|| f(message)))
            }
            DeliveryEvent::Error(error) => {
                let listener = self.slots.error.read().clone();
                listener.map(|f| invoke(|| f(error)))
            }
            DeliveryEvent::Disconnect(disconnect) => {
                let listener = self.slots.error.read().clone();
                let error = ErrorEvent::from(disconnect.clone());
                listener.map(|f| invoke(|| f(&error)))
            }
            DeliveryEvent::Connection(notice) => {
                let listener = self.slots.connection.read().clone();
                listener.map(|f| invoke(|| f(notice)))
            }
        };

        match result {
            None => {
                tracing::trace!("No {} listener, discarding {} event", kind, event.name());
                DispatchOutcome::NoListener
            }
            Some(Ok(())) => DispatchOutcome::Delivered,
            Some(Err(reason)) => {
                let failure = ErrorEvent::new(format!("{} listener failed: {}", kind, reason));
                tracing::warn!("{}", failure);
                DispatchOutcome::ListenerFailed {
                    reported: self.report(failure),
                }
            }
        }
    }

    /// Hand a listener failure to the error listener exactly once
    fn report(&self, failure: ErrorEvent) -> bool {
        let Some(listener) = self.slots.error.read().clone() else {
            tracing::error!("Unreported listener failure: {}", failure);
            return false;
        };

        match invoke(|| listener(&failure)) {
            Ok(()) => true,
            Err(reason) => {
                tracing::error!(
                    "Error listener failed while reporting '{}': {}",
                    failure,
                    reason
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("message", &self.has_listener(EventKind::Message))
            .field("error", &self.has_listener(EventKind::Error))
            .field("connection", &self.has_listener(EventKind::Connection))
            .finish()
    }
}

fn invoke(f: impl FnOnce() -> ListenerResult) -> std::result::Result<(), String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DisconnectEvent, QoS};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message_event(payload: &'static str) -> DeliveryEvent {
        DeliveryEvent::Message(MessageEvent::new("topic/a", payload, QoS::AtMostOnce, false))
    }

    fn collect_errors(dispatcher: &EventDispatcher) -> Arc<Mutex<Vec<String>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        dispatcher.set_error_listener(move |e| {
            sink.lock().push(e.message.clone());
            Ok(())
        });
        errors
    }

    #[test]
    fn test_empty_slot_is_noop() {
        let dispatcher = EventDispatcher::new();
        assert_eq!(dispatcher.dispatch(&message_event("x")), DispatchOutcome::NoListener);
    }

    #[test]
    fn test_message_routing() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.set_message_listener(move |m| {
            sink.lock().push((m.topic.clone(), m.payload_str().map(str::to_owned)));
            Ok(())
        });

        assert_eq!(dispatcher.dispatch(&message_event("hello")), DispatchOutcome::Delivered);
        assert_eq!(
            *seen.lock(),
            vec![("topic/a".to_string(), Some("hello".to_string()))]
        );
    }

    #[test]
    fn test_disconnect_goes_to_error_listener() {
        let dispatcher = EventDispatcher::new();
        let errors = collect_errors(&dispatcher);

        let event = DeliveryEvent::Disconnect(DisconnectEvent::new(Some(3), "server unavailable"));
        assert_eq!(dispatcher.dispatch(&event), DispatchOutcome::Delivered);
        assert_eq!(
            *errors.lock(),
            vec!["disconnected (code 3): server unavailable".to_string()]
        );
    }

    #[test]
    fn test_listener_error_is_reported_once() {
        let dispatcher = EventDispatcher::new();
        let errors = collect_errors(&dispatcher);
        dispatcher.set_message_listener(|_| Err("bad payload".into()));

        let outcome = dispatcher.dispatch(&message_event("x"));
        assert_eq!(outcome, DispatchOutcome::ListenerFailed { reported: true });
        assert_eq!(
            *errors.lock(),
            vec!["message listener failed: bad payload".to_string()]
        );
    }

    #[test]
    fn test_listener_panic_is_contained() {
        let dispatcher = EventDispatcher::new();
        let errors = collect_errors(&dispatcher);
        dispatcher.set_message_listener(|_| panic!("listener blew up"));

        let outcome = dispatcher.dispatch(&message_event("x"));
        assert_eq!(outcome, DispatchOutcome::ListenerFailed { reported: true });
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("listener blew up"));

        // Dispatcher keeps working afterwards
        dispatcher.set_message_listener(|_| Ok(()));
        assert_eq!(dispatcher.dispatch(&message_event("y")), DispatchOutcome::Delivered);
    }

    #[test]
    fn test_failing_error_listener_is_not_retried() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        dispatcher.set_error_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("still broken".into())
        });

        let outcome = dispatcher.dispatch(&DeliveryEvent::Error(ErrorEvent::new("first")));
        assert_eq!(outcome, DispatchOutcome::ListenerFailed { reported: false });
        // Original invocation plus exactly one report
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_without_error_listener() {
        let dispatcher = EventDispatcher::new();
        dispatcher.set_message_listener(|_| Err("nobody hears this".into()));

        assert_eq!(
            dispatcher.dispatch(&message_event("x")),
            DispatchOutcome::ListenerFailed { reported: false }
        );
    }

    #[test]
    fn test_replace_and_clear() {
        let dispatcher = EventDispatcher::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        assert!(!dispatcher.set_message_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        dispatcher.dispatch(&message_event("a"));

        let counter = Arc::clone(&second);
        assert!(dispatcher.set_message_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        dispatcher.dispatch(&message_event("b"));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(dispatcher.clear(EventKind::Message));
        assert!(!dispatcher.has_listener(EventKind::Message));
        assert_eq!(dispatcher.dispatch(&message_event("c")), DispatchOutcome::NoListener);
    }

    #[test]
    fn test_listener_can_replace_itself() {
        let dispatcher = EventDispatcher::new();
        let inner = dispatcher.clone();
        let replaced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&replaced);

        dispatcher.set_message_listener(move |_| {
            let counter = Arc::clone(&counter);
            inner.set_message_listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });

        dispatcher.dispatch(&message_event("a"));
        dispatcher.dispatch(&message_event("b"));
        assert_eq!(replaced.load(Ordering::SeqCst), 1);
    }
}
