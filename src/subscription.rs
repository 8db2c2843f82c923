//! Disposable handler registrations.
//!
//! Every listener API in the engine (router handlers, status listeners,
//! presence and health observers) hands back a [`Subscription`]. Dropping it,
//! or calling [`Subscription::unsubscribe`], removes exactly that handler.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::warn;

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slots<T> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<T>>,
}

/// Ordered, fan-out set of handlers for one event stream.
pub struct HandlerSet<T> {
    inner: Arc<Mutex<Slots<T>>>,
}

impl<T> Clone for HandlerSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for HandlerSet<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }
}

impl<T: 'static> HandlerSet<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`. It stays registered until the returned
    /// subscription is dropped.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut slots = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = slots.next_id;
            slots.next_id += 1;
            slots.handlers.insert(id, Arc::new(handler));
            id
        };

        let weak: Weak<Mutex<Slots<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .handlers
                    .remove(&id);
            }
        })
    }

    /// Call every handler with `value` in registration order. Returns the
    /// number of handlers that completed without panicking.
    pub fn emit(&self, label: &str, value: &T) -> usize {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler<T>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .values()
            .cloned()
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(value))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    warn!(event = label, panic = %panic_message(&*panic), "handler panicked");
                }
            }
        }
        delivered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_owned();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_owned()
}

// =============================================================================
// SUBSCRIPTION HANDLE
// =============================================================================

/// Handle that removes its handler when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    /// Keep the handler registered for the lifetime of the owning set.
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
#[path = "subscription_test.rs"]
mod tests;
