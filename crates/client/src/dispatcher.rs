//! Event fan-out by event name.
//!
//! Handlers run synchronously on the connection task, in registration
//! order, specific subscribers before wildcard ones. A panicking handler is
//! logged and skipped; the remaining handlers still run.

use std::{
    any::Any,
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {
    gatelink_protocol::{EventFrame, subscriptions::WILDCARD},
    tracing::{trace, warn},
};

use crate::telemetry;

/// Event names synthesised by the client itself.
pub mod meta {
    /// Emitted after a reconnect once the new handshake completed.
    /// Payload: `{"epoch": n}`.
    pub const RECONNECTED: &str = "reconnected";
    /// Emitted before an event whose `seq` skipped ahead.
    /// Payload: `{"expected": n, "received": m}`.
    pub const SEQ_GAP: &str = "seq.gap";
}

pub type EventHandler = Arc<dyn Fn(&EventFrame) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub panicked: usize,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_event: HashMap<String, Vec<(SubscriptionId, EventHandler)>>,
    index: HashMap<SubscriptionId, String>,
}

#[derive(Default)]
pub struct EventDispatcher {
    registry: Mutex<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe `handler` to `event`; `"*"` receives every event.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        let event = event.into();
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .by_event
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        registry.index.insert(id, event);
        id
    }

    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&EventFrame) + Send + Sync + 'static,
    {
        self.on(WILDCARD, handler)
    }

    /// Remove a subscription. Idempotent.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let Some(event) = registry.index.remove(&id) else {
            return false;
        };
        if let Some(handlers) = registry.by_event.get_mut(&event) {
            handlers.retain(|(sub, _)| *sub != id);
            if handlers.is_empty() {
                registry.by_event.remove(&event);
            }
        }
        true
    }

    /// Handlers subscribed to exactly `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.lock().by_event.get(event).map_or(0, Vec::len)
    }

    /// Deliver `frame` to its subscribers.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe from inside a callback without deadlocking; such changes
    /// take effect from the next event.
    pub fn dispatch(&self, frame: &EventFrame) -> DispatchReport {
        let handlers: Vec<(SubscriptionId, EventHandler)> = {
            let registry = self.lock();
            let specific = (frame.event != WILDCARD)
                .then(|| registry.by_event.get(frame.event.as_str()))
                .flatten();
            specific
                .into_iter()
                .chain(registry.by_event.get(WILDCARD))
                .flatten()
                .cloned()
                .collect()
        };

        let mut report = DispatchReport::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(()) => report.delivered += 1,
                Err(panic) => {
                    report.panicked += 1;
                    telemetry::handler_panicked(&frame.event);
                    warn!(
                        event = %frame.event,
                        subscription = id.0,
                        panic = %panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                },
            }
        }
        telemetry::event_dispatched(&frame.event);
        trace!(event = %frame.event, seq = ?frame.seq, delivered = report.delivered, "event dispatched");
        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, serde_json::json};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> impl Fn(&EventFrame) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |frame: &EventFrame| log.lock().unwrap().push(format!("{tag}:{}", frame.event))
    }

    #[test]
    fn specific_handlers_run_before_wildcard() {
        let dispatcher = EventDispatcher::new();
        let log: Log = Log::default();
        dispatcher.on_any(recorder(&log, "any"));
        dispatcher.on("presence", recorder(&log, "first"));
        dispatcher.on("presence", recorder(&log, "second"));

        let report = dispatcher.dispatch(&EventFrame::new("presence", json!({})));
        assert_eq!(report.delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec![
            "first:presence",
            "second:presence",
            "any:presence"
        ]);
    }

    #[test]
    fn unsubscribed_events_reach_only_wildcard() {
        let dispatcher = EventDispatcher::new();
        let log: Log = Log::default();
        dispatcher.on("presence", recorder(&log, "p"));
        dispatcher.on_any(recorder(&log, "any"));
        dispatcher.dispatch(&EventFrame::new("custom.unknown", json!(null)));
        assert_eq!(*log.lock().unwrap(), vec!["any:custom.unknown"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let dispatcher = EventDispatcher::new();
        let log: Log = Log::default();
        dispatcher.on("chat", |_: &EventFrame| panic!("handler bug"));
        dispatcher.on("chat", recorder(&log, "after"));
        dispatcher.on_any(recorder(&log, "any"));

        let report = dispatcher.dispatch(&EventFrame::new("chat", json!({})));
        assert_eq!(report, DispatchReport {
            delivered: 2,
            panicked: 1
        });
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn off_is_idempotent() {
        let dispatcher = EventDispatcher::new();
        let log: Log = Log::default();
        let id = dispatcher.on("tick", recorder(&log, "t"));
        assert_eq!(dispatcher.handler_count("tick"), 1);
        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        assert_eq!(dispatcher.handler_count("tick"), 0);
        dispatcher.dispatch(&EventFrame::new("tick", json!({})));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn handlers_may_unsubscribe_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let calls = Arc::new(Mutex::new(0));
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::default();

        let handler = {
            let dispatcher = Arc::clone(&dispatcher);
            let calls = Arc::clone(&calls);
            let id_slot = Arc::clone(&id_slot);
            move |_: &EventFrame| {
                *calls.lock().unwrap() += 1;
                if let Some(id) = *id_slot.lock().unwrap() {
                    dispatcher.off(id);
                }
            }
        };
        let id = dispatcher.on("health", handler);
        *id_slot.lock().unwrap() = Some(id);

        dispatcher.dispatch(&EventFrame::new("health", json!({})));
        dispatcher.dispatch(&EventFrame::new("health", json!({})));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
