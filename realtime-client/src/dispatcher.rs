//! Message dispatcher
//!
//! Routes each decoded frame to every handler registered under its
//! dispatch key. Handlers run in registration order. The handler table is
//! never locked while a handler runs, so handlers may register or remove
//! handlers themselves.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use realtime_core::{DispatchKey, Frame};
use tracing::{debug, error};

/// Callback invoked with each matching item
pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callback invoked with each matching frame
pub type FrameHandler = Handler<Frame>;

/// Identifier assigned to each registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Keyed observer registry
pub trait Publisher<T> {
    /// Register a handler under `key`; the returned registration removes it again
    fn subscribe(&self, key: &str, handler: Handler<T>) -> Registration;

    /// Remove a handler by identity, returns false if it was not registered
    fn unsubscribe(&self, key: &str, handler: &Handler<T>) -> bool;
}

struct Entry {
    id: HandlerId,
    handler: FrameHandler,
}

#[derive(Default)]
struct HandlerTable {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<Entry>>>,
}

impl HandlerTable {
    fn remove_where(&self, key: &str, matches: impl Fn(&Entry) -> bool) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(entries) = handlers.get_mut(key) else {
            return false;
        };

        let removed = match entries.iter().position(matches) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        };

        if entries.is_empty() {
            handlers.remove(key);
        }
        removed
    }
}

/// Disposer for one handler registration
///
/// Dropping it leaves the handler registered; call [`Registration::dispose`]
/// to remove it.
#[derive(Debug)]
pub struct Registration {
    key: String,
    id: HandlerId,
    table: Weak<HandlerTable>,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove the handler, returns false if it was already gone
    pub fn dispose(self) -> bool {
        match self.table.upgrade() {
            Some(table) => table.remove_where(&self.key, |entry| entry.id == self.id),
            None => false,
        }
    }
}

/// Routes frames to registered handlers
#[derive(Clone)]
pub struct Dispatcher {
    dispatch_key: DispatchKey,
    table: Arc<HandlerTable>,
}

impl Dispatcher {
    pub fn new(dispatch_key: DispatchKey) -> Self {
        Self {
            dispatch_key,
            table: Arc::new(HandlerTable::default()),
        }
    }

    pub fn dispatch_key(&self) -> DispatchKey {
        self.dispatch_key
    }

    /// Register a handler; multiple handlers per key accumulate
    pub fn on(&self, key: &str, handler: FrameHandler) -> Registration {
        let id = HandlerId(self.table.next_id.fetch_add(1, Ordering::Relaxed));

        self.table
            .handlers
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(Entry { id, handler });

        debug!("[Realtime WS] Registered {} for '{}'", id, key);

        Registration {
            key: key.to_string(),
            id,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Remove the first registration of `handler` under `key`
    pub fn off(&self, key: &str, handler: &FrameHandler) -> bool {
        self.table
            .remove_where(key, |entry| Arc::ptr_eq(&entry.handler, handler))
    }

    /// Number of handlers registered under `key`
    pub fn handler_count(&self, key: &str) -> usize {
        self.table
            .handlers
            .lock()
            .get(key)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Invoke every handler for the frame's key, returns how many ran
    ///
    /// A panicking handler is logged and skipped; the rest still run.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        let key = frame.dispatch_key(self.dispatch_key);

        let handlers: Vec<FrameHandler> = match self.table.handlers.lock().get(key) {
            Some(entries) => entries.iter().map(|entry| Arc::clone(&entry.handler)).collect(),
            None => return 0,
        };

        let mut invoked = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(()) => invoked += 1,
                Err(_) => error!("[Realtime WS] Handler for '{}' panicked", key),
            }
        }
        invoked
    }
}

impl Publisher<Frame> for Dispatcher {
    fn subscribe(&self, key: &str, handler: FrameHandler) -> Registration {
        self.on(key, handler)
    }

    fn unsubscribe(&self, key: &str, handler: &FrameHandler) -> bool {
        self.off(key, handler)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchKey::default())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("dispatch_key", &self.dispatch_key)
            .field("keys", &self.table.handlers.lock().len())
            .finish()
    }
}
