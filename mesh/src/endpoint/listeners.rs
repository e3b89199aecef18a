//! Listener registry with subscription handles
//!
//! A listener stays registered while its `Subscription` is alive. Dropping the
//! handle unsubscribes, `detach()` keeps the listener for the registry's lifetime.
//! Events are dispatched to a snapshot of the listeners, and a panicking
//! listener is logged and skipped.

use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::warn;

struct Registry<L: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Arc<L>)>,
}

pub struct ListenerSet<L: ?Sized> {
    inner: Arc<Mutex<Registry<L>>>,
}

impl<L: ?Sized> Clone for ListenerSet<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self, listener: Arc<L>) -> Subscription {
        let id = {
            let mut registry = self.inner.lock();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.entries.push((id, listener));
            id
        };
        let weak: Weak<Mutex<Registry<L>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().entries.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    /// Invokes `f` on every listener registered at the time of the call
    pub fn fire<F>(&self, event: &'static str, f: F)
    where
        F: Fn(&L),
    {
        for listener in self.snapshot() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| f(&*listener))) {
                warn!(event, "Listener panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }
}

impl<L: ?Sized + Send + Sync + 'static> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Registration handle returned by `ListenerSet::subscribe`
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Keeps the listener registered for as long as the registry lives
    pub fn detach(mut self) {
        self.remove = None;
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
