//! Proxy-side abstraction.
//!
//! The bridge does not own the proxy runtime. The host feeds player events
//! in through an [`EventDispatcher`] and exposes the chat surface through
//! the [`ProxyApi`] trait. Handlers registered on the dispatcher are invoked
//! synchronously, in registration order, on whatever thread the host
//! dispatches from.

use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A proxy-side event flowing towards Discord. Transient — constructed,
/// formatted, and discarded per event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    Chat { player: String, text: String },
    Join { player: String },
    Leave { player: String },
}

impl ProxyEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProxyEvent::Chat { .. } => EventKind::Chat,
            ProxyEvent::Join { .. } => EventKind::Join,
            ProxyEvent::Leave { .. } => EventKind::Leave,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Chat,
    Join,
    Leave,
}

// ---------------------------------------------------------------------------
// Host traits
// ---------------------------------------------------------------------------

/// Chat surface the host proxy exposes to the bridge.
pub trait ProxyApi: Send + Sync {
    /// Broadcast a system chat message to every connected player.
    fn broadcast(&self, message: &str);

    /// Names of connected players, in arrival order.
    fn online_players(&self) -> Vec<String>;

    /// Alternate join/leave event source advertised by the deployment, if
    /// any. Precondition: a deployment provides either the primary
    /// join/leave events or an alternate source, never both — the bridge
    /// registers with whichever is offered and does not deduplicate.
    fn alt_presence_source(&self) -> Option<&dyn AltPresenceSource> {
        None
    }
}

/// Capability interface for a third-party join/leave event source.
pub trait AltPresenceSource {
    /// Register a handler for this source's join/leave events.
    fn register(&self, handler: Handler);
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub type Handler = Box<dyn Fn(&ProxyEvent) + Send + Sync>;

/// Registry mapping [`EventKind`] to ordered handler lists.
///
/// The host owns the dispatch loop; this type only records subscriptions
/// and invokes them. Handlers must not block for unbounded time — the
/// bridge's own handlers hand work off to the async runtime immediately.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `kind`. Invocation order follows
    /// registration order.
    pub fn subscribe(&mut self, kind: EventKind, handler: Handler) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Invoke every handler registered for the event's kind, in order.
    pub fn dispatch(&self, event: &ProxyEvent) {
        if let Some(list) = self.handlers.get(&event.kind()) {
            for handler in list {
                handler(event);
            }
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self
            .handlers
            .iter()
            .map(|(k, v)| (format!("{:?}", k), v.len()))
            .collect();
        f.debug_struct("EventDispatcher")
            .field("handlers", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn event_kind_matches_variant() {
        let chat = ProxyEvent::Chat {
            player: "a".into(),
            text: "b".into(),
        };
        assert_eq!(chat.kind(), EventKind::Chat);
        assert_eq!(
            ProxyEvent::Join { player: "a".into() }.kind(),
            EventKind::Join
        );
        assert_eq!(
            ProxyEvent::Leave { player: "a".into() }.kind(),
            EventKind::Leave
        );
    }

    #[test]
    fn dispatch_invokes_only_matching_kind() {
        let mut dispatcher = EventDispatcher::new();
        let chat_hits = Arc::new(AtomicUsize::new(0));
        let join_hits = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&chat_hits);
        dispatcher.subscribe(
            EventKind::Chat,
            Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let j = Arc::clone(&join_hits);
        dispatcher.subscribe(
            EventKind::Join,
            Box::new(move |_| {
                j.fetch_add(1, Ordering::SeqCst);
            }),
        );

        dispatcher.dispatch(&ProxyEvent::Chat {
            player: "p".into(),
            text: "t".into(),
        });

        assert_eq!(chat_hits.load(Ordering::SeqCst), 1);
        assert_eq!(join_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let mut dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            dispatcher.subscribe(
                EventKind::Join,
                Box::new(move |_| {
                    order.lock().unwrap().push(tag);
                }),
            );
        }

        dispatcher.dispatch(&ProxyEvent::Join { player: "p".into() });
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn dispatch_with_no_handlers_is_a_noop() {
        let dispatcher = EventDispatcher::new();
        dispatcher.dispatch(&ProxyEvent::Leave { player: "p".into() });
        assert_eq!(dispatcher.handler_count(EventKind::Leave), 0);
    }
}
