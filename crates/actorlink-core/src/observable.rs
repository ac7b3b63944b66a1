/*!
 * Synchronous observer lists.
 *
 * An [`Observable`] is a small building block embedded in devices and
 * connections. Callbacks are invoked synchronously, on the notifying task,
 * in the order they were registered.
 */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::utils::lock;

/// A registered callback
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Observable::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

impl Subscription {
    /// Get the raw subscription number
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// An ordered list of callbacks interested in values of type `T`
pub struct Observable<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(Subscription, Callback<T>)>>,
}

impl<T> Observable<T> {
    /// Create an observable with no subscribers
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback; it is called for every later notification
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let subscription = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.callbacks).push((subscription, Arc::new(callback)));
        trace!(id = subscription.0, "Added observer");
        subscription
    }

    /// Remove a callback. Returns false if it was not (or no longer) registered.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut callbacks = lock(&self.callbacks);
        let before = callbacks.len();
        callbacks.retain(|(sub, _)| *sub != subscription);
        before != callbacks.len()
    }

    /// Call every registered callback with `value`, returning how many were called
    ///
    /// The callback list is snapshotted first, so callbacks may subscribe or
    /// unsubscribe re-entrantly without deadlocking.
    pub fn notify(&self, value: &T) -> usize {
        let snapshot: Vec<Callback<T>> = lock(&self.callbacks)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in &snapshot {
            callback(value);
        }
        snapshot.len()
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        lock(&self.callbacks).len()
    }

    /// Whether no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every callback
    pub fn clear(&self) {
        lock(&self.callbacks).clear();
    }
}

impl<T> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("subscribers", &self.len())
            .finish()
    }
}
