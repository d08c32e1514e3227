//! SubscriptionRegistry: fan-out for one channel.
//!
//! Mutation happens under the lock; delivery happens outside it against a
//! point-in-time snapshot. Snapshot order is newest-first, so a listener
//! registered for a fresh operation sees a value before older, more general
//! listeners do.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;
use uuid::Uuid;

use crate::handle::{OnCancel, OnEvent, Subscription};
use crate::sync::lock;

/// Listeners for a single channel. Cheap to clone; clones share listeners.
pub struct SubscriptionRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

pub(crate) struct RegistryInner<T> {
    subscriptions: Mutex<Vec<Subscription<T>>>,
}

impl<T> RegistryInner<T> {
    /// Remove a listener by id. The removed handle is dropped after the lock
    /// is released, since dropping the last reference drops the callback and
    /// whatever it captured.
    pub(crate) fn detach(&self, id: Uuid) -> bool {
        let removed = {
            let mut subscriptions = lock(&self.subscriptions);
            let position = subscriptions.iter().position(|s| s.id() == id);
            position.map(|pos| subscriptions.remove(pos))
        };
        removed.is_some()
    }
}

impl<T: 'static> SubscriptionRegistry<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. The callback receives each value plus its own
    /// handle, which it may cancel to stop further deliveries.
    pub fn subscribe<F>(&self, on_event: F) -> Subscription<T>
    where
        F: Fn(&T, &Subscription<T>) + Send + Sync + 'static,
    {
        self.insert(Box::new(on_event), None)
    }

    /// Register a listener with a teardown that runs exactly once, when the
    /// handle is cancelled by anyone (including the listener itself).
    pub fn subscribe_with_teardown<F, C>(&self, on_event: F, on_cancel: C) -> Subscription<T>
    where
        F: Fn(&T, &Subscription<T>) + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.insert(Box::new(on_event), Some(Box::new(on_cancel)))
    }

    fn insert(&self, on_event: OnEvent<T>, on_cancel: Option<OnCancel>) -> Subscription<T> {
        let subscription = Subscription::new(on_event, on_cancel, Arc::downgrade(&self.inner));
        lock(&self.inner.subscriptions).push(subscription.clone());
        trace!(subscription = %subscription.id(), "Subscribed");
        subscription
    }

    /// Deliver `value` to every listener live at the moment of the call,
    /// newest first. Returns how many listeners were invoked.
    ///
    /// Listeners added during delivery only see later values. A listener
    /// cancelled mid-delivery by a sibling still gets this value, since it was
    /// already in the snapshot.
    pub fn receive(&self, value: &T) -> usize {
        let snapshot: Vec<Subscription<T>> = {
            let subscriptions = lock(&self.inner.subscriptions);
            subscriptions.iter().rev().cloned().collect()
        };

        for subscription in &snapshot {
            subscription.deliver(value);
        }

        snapshot.len()
    }
}

impl<T> SubscriptionRegistry<T> {
    /// Cancel a listener created by this registry. Returns `false` if it was
    /// already cancelled or belongs to another registry.
    pub fn remove(&self, subscription: &Subscription<T>) -> bool {
        if !subscription.belongs_to(&self.inner) {
            return false;
        }
        subscription.cancel()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.subscriptions).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }
}

impl<T: 'static> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for SubscriptionRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SubscriptionRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}
