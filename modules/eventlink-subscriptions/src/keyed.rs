//! KeyedRegistry: one SubscriptionRegistry per correlation key.
//!
//! Partitions are created on first use and never removed; an empty registry
//! is a valid placeholder. Delivery to one key never scans or blocks another.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::handle::Subscription;
use crate::registry::SubscriptionRegistry;
use crate::sync::{read, write};

pub struct KeyedRegistry<K, T> {
    partitions: Arc<RwLock<HashMap<K, SubscriptionRegistry<T>>>>,
}

impl<K, T> KeyedRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: 'static,
{
    pub fn new() -> Self {
        Self {
            partitions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The registry for `key`, created if missing.
    ///
    /// Read lock first; the write lock is only taken on a miss, and the entry
    /// API re-checks under it so racing callers share one registry.
    pub fn registry(&self, key: &K) -> SubscriptionRegistry<T> {
        if let Some(registry) = read(&self.partitions).get(key) {
            return registry.clone();
        }
        write(&self.partitions)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Register a listener for values delivered under `key`.
    pub fn queue<F>(&self, key: &K, on_event: F) -> Subscription<T>
    where
        F: Fn(&T, &Subscription<T>) + Send + Sync + 'static,
    {
        self.registry(key).subscribe(on_event)
    }

    pub fn queue_with_teardown<F, C>(&self, key: &K, on_event: F, on_cancel: C) -> Subscription<T>
    where
        F: Fn(&T, &Subscription<T>) + Send + Sync + 'static,
        C: FnOnce() + Send + 'static,
    {
        self.registry(key).subscribe_with_teardown(on_event, on_cancel)
    }

    /// Deliver `value` to the listeners of `key` only. A key nobody has
    /// queued on is dropped silently. Returns how many listeners were invoked.
    pub fn receive(&self, key: &K, value: &T) -> usize {
        let registry = read(&self.partitions).get(key).cloned();
        match registry {
            Some(registry) => registry.receive(value),
            None => {
                trace!(key = ?key, "No listeners for key; dropping value");
                0
            }
        }
    }

    /// True iff every partition is empty.
    pub fn is_empty(&self) -> bool {
        read(&self.partitions).values().all(|r| r.is_empty())
    }

    /// Whether a partition exists for `key` (it may still be empty).
    pub fn contains_key(&self, key: &K) -> bool {
        read(&self.partitions).contains_key(key)
    }
}

impl<K, T> Default for KeyedRegistry<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Clone for KeyedRegistry<K, T> {
    fn clone(&self) -> Self {
        Self {
            partitions: Arc::clone(&self.partitions),
        }
    }
}
