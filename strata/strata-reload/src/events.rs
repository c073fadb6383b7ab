//! Listener registries with RAII subscriptions.

use parking_lot::RwLock;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Callback invoked for every emitted event.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A set of callbacks interested in events of type `E`.
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Callback<E>)>>,
}

impl<E: 'static> Listeners<E> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Register a callback. It stays registered until the returned
    /// subscription is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, Arc::new(callback)));

        let weak: Weak<Self> = Arc::downgrade(self);
        let source: Weak<dyn Any + Send + Sync> = weak.clone();
        Subscription {
            source,
            cancel: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    listeners.entries.write().retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    /// Invoke every callback. Callbacks run outside the registry lock, so they
    /// may subscribe or unsubscribe freely.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> =
            self.entries.read().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Handle for a registered callback; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    source: Weak<dyn Any + Send + Sync>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Whether the registry this subscription belongs to still exists. A
    /// subscription whose source is gone will never fire again.
    pub fn is_live(&self) -> bool {
        self.source.strong_count() > 0
    }

    /// Keep the callback registered for the lifetime of the source.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .field("live", &self.is_live())
            .finish()
    }
}
