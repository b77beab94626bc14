//! Event-type keyed subscriber registry
//!
//! Handlers are kept in registration order per key. A handler is removed by
//! the `Subscription` returned from `on`, or by `Arc` identity via `off`.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use super::envelope::Envelope;

/// Key whose handlers receive events no type-specific handler claims.
pub const WILDCARD: &str = "*";

/// Anything callable with an event payload.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Registration handle; pass to `unsubscribe` to remove exactly this entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    event: String,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }
}

#[derive(Default)]
pub struct SubscriberRegistry {
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same handler twice delivers twice.
    pub fn on(&self, event: &str, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        Subscription {
            id,
            event: event.to_string(),
        }
    }

    /// Remove every registration of `handler` (by `Arc` identity) under `event`.
    pub fn off(&self, event: &str, handler: &Handler) -> usize {
        self.remove_where(event, |(_, h)| Arc::ptr_eq(h, handler))
    }

    /// Remove a single registration.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.remove_where(&subscription.event, |(id, _)| *id == subscription.id) > 0
    }

    fn remove_where(&self, event: &str, matches: impl Fn(&(u64, Handler)) -> bool) -> usize {
        let mut guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = guard.get_mut(event) else {
            return 0;
        };
        let before = list.len();
        list.retain(|entry| !matches(entry));
        let removed = before - list.len();
        if list.is_empty() {
            guard.remove(event);
        }
        removed
    }

    #[cfg(test)]
    pub fn handler_count(&self, event: &str) -> usize {
        let guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(event).map_or(0, Vec::len)
    }

    /// Deliver an envelope. Returns the number of handlers invoked.
    ///
    /// Type-specific handlers get `data`. Only when none exist do wildcard
    /// handlers run, and they get the whole envelope. Handlers run on a
    /// snapshot taken before the first call, outside the lock; a panicking
    /// handler is logged and does not stop the others.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let (targets, payload) = {
            let guard = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            match guard.get(&envelope.kind).filter(|list| !list.is_empty()) {
                Some(list) => (snapshot(list), envelope.data.clone()),
                None => match guard.get(WILDCARD) {
                    Some(list) => (snapshot(list), envelope.to_value()),
                    None => (Vec::new(), Value::Null),
                },
            }
        };

        if targets.is_empty() {
            tracing::debug!("No subscribers for '{}'", envelope.kind);
        }
        for handler in &targets {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| handler(&payload)));
            if delivered.is_err() {
                tracing::error!("Subscriber for '{}' panicked", envelope.kind);
            }
        }
        targets.len()
    }
}

fn snapshot(list: &[(u64, Handler)]) -> Vec<Handler> {
    list.iter().map(|(_, h)| Arc::clone(h)).collect()
}
