//! Event dispatcher and subscription registry.
//!
//! Handlers are keyed by event name and identified by their `Arc`
//! allocation: registering the same `Arc` twice is a no-op, and `off` removes
//! exactly the `Arc` it is given. Dispatch snapshots the handler list, drops
//! the registry lock, then runs handlers in registration order, so a handler
//! may subscribe or unsubscribe while it runs; such changes apply from the
//! next dispatch on.

use flip_core::{decode_frame, SyncEvent};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, warn};

pub type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Wrap a closure as a registrable handler.
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&SyncEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

type Registry = HashMap<String, Vec<Handler>>;

#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`. Returns `false` when that exact handler
    /// was already registered for the event.
    pub fn on(&self, event: &str, handler: Handler) -> bool {
        register(&self.registry, event, handler)
    }

    /// Remove `handler` from `event`. Returns `false` when it was not registered.
    pub fn off(&self, event: &str, handler: &Handler) -> bool {
        unregister(&self.registry, event, handler)
    }

    /// Register `handler` and return a guard that unregisters it on drop.
    pub fn subscribe(&self, event: &str, handler: Handler) -> Subscription {
        register(&self.registry, event, handler.clone());
        Subscription {
            registry: Arc::downgrade(&self.registry),
            event: event.to_string(),
            handler: Some(handler),
        }
    }

    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.registry).get(event).map_or(0, Vec::len)
    }

    /// Invoke every handler registered for the event's name. A panicking
    /// handler is logged and skipped; the rest still run. Returns how many
    /// handlers completed.
    pub fn emit(&self, event: &SyncEvent) -> usize {
        let name = event.name();
        let handlers: Vec<Handler> = match lock(&self.registry).get(name) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };

        let mut completed = 0;
        for (index, handler) in handlers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => completed += 1,
                Err(payload) => {
                    error!(
                        event = "sync_handler_panicked",
                        name,
                        handler_index = index,
                        reason = %panic_reason(payload.as_ref())
                    );
                }
            }
        }
        completed
    }

    /// Decode one inbound text frame and dispatch it. Malformed frames are
    /// dropped; unknown event names are ignored.
    pub fn dispatch_frame(&self, text: &str, max_frame_bytes: usize) -> Option<usize> {
        let frame = match decode_frame(text, max_frame_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "sync_frame_dropped", error = %err);
                return None;
            }
        };
        let name = frame.event.clone();
        match SyncEvent::decode(frame) {
            Ok(Some(event)) => Some(self.emit(&event)),
            Ok(None) => {
                debug!(event = "sync_event_ignored", name = %name);
                None
            }
            Err(err) => {
                warn!(event = "sync_event_malformed", name = %name, error = %err);
                None
            }
        }
    }
}

/// Keeps a handler registered for as long as it is alive.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    event: String,
    handler: Option<Handler>,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Unregister now instead of at drop.
    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let (Some(handler), Some(registry)) = (self.handler.take(), self.registry.upgrade()) {
            unregister(&registry, &self.event, &handler);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn register(registry: &Mutex<Registry>, event: &str, handler: Handler) -> bool {
    let mut registry = lock(registry);
    let handlers = registry.entry(event.to_string()).or_default();
    if handlers.iter().any(|existing| same_handler(existing, &handler)) {
        return false;
    }
    handlers.push(handler);
    true
}

fn unregister(registry: &Mutex<Registry>, event: &str, handler: &Handler) -> bool {
    let mut registry = lock(registry);
    let Some(handlers) = registry.get_mut(event) else {
        return false;
    };
    let before = handlers.len();
    handlers.retain(|existing| !same_handler(existing, handler));
    let removed = handlers.len() != before;
    if handlers.is_empty() {
        registry.remove(event);
    }
    removed
}

// Compare allocations only; vtable pointers for the same closure type may
// differ across codegen units.
fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
