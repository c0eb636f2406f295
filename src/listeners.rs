//! Player event listeners.
//!
//! [`EventManager`] keeps per-event handler lists behind a `parking_lot`
//! lock. Dispatch runs on a snapshot of the list, so a handler may register
//! or remove listeners (itself included) without deadlocking, and a handler
//! that panics is logged and skipped without affecting the others.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rp_core::PlayerEvent;
use serde_json::Value;

/// Opaque handle returned by [`EventManager::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Listener callback. Receives the event payload, `Value::Null` when the
/// event carries none.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
pub struct EventManager {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<PlayerEvent, Vec<(ListenerId, Handler)>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`.
    pub fn on(
        &self,
        event: PlayerEvent,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(event)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered for
    /// `event`.
    pub fn off(&self, event: PlayerEvent, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(handlers) = listeners.get_mut(&event) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            listeners.remove(&event);
        }
        removed
    }

    /// Call every listener of `event` in registration order.
    pub fn emit(&self, event: PlayerEvent, data: &Value) {
        let handlers: Vec<(ListenerId, Handler)> = match self.listeners.read().get(&event) {
            Some(handlers) => handlers.clone(),
            None => return,
        };

        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                tracing::error!("Listener {id} for '{event}' panicked");
            }
        }
    }

    /// Drop every listener.
    pub fn remove_all(&self) {
        self.listeners.write().clear();
    }

    pub fn listener_count(&self, event: PlayerEvent) -> usize {
        self.listeners.read().get(&event).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_struct("EventManager")
            .field("events", &listeners.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
