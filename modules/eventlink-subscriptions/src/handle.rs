//! Subscription: a cancellable token for one registered listener.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;
use uuid::Uuid;

use crate::registry::RegistryInner;
use crate::sync::lock;

pub(crate) type OnEvent<T> = Box<dyn Fn(&T, &Subscription<T>) + Send + Sync>;
pub(crate) type OnCancel = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Cancellable
// ---------------------------------------------------------------------------

/// Something that can be disarmed exactly once.
///
/// Object safe, so guards over different event types (and timers) can sit in
/// one collection and be torn down together.
pub trait Cancellable: Send + Sync {
    /// Disarm. Returns `true` only for the call that actually cancelled.
    fn cancel(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle for one listener.
///
/// The registry that created it owns the listener; the handle keeps only a
/// weak reference back. Dropping a handle does **not** cancel it. Clones
/// refer to the same listener.
pub struct Subscription<T> {
    inner: Arc<SubscriptionInner<T>>,
}

struct SubscriptionInner<T> {
    id: Uuid,
    cancelled: AtomicBool,
    on_event: OnEvent<T>,
    on_cancel: Mutex<Option<OnCancel>>,
    registry: Weak<RegistryInner<T>>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        on_event: OnEvent<T>,
        on_cancel: Option<OnCancel>,
        registry: Weak<RegistryInner<T>>,
    ) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                id: Uuid::new_v4(),
                cancelled: AtomicBool::new(false),
                on_event,
                on_cancel: Mutex::new(on_cancel),
                registry,
            }),
        }
    }

    /// Process-unique identity of this listener.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Remove the listener from its registry and run its teardown.
    ///
    /// Idempotent: only the first call removes and tears down; later calls
    /// return `false`. Safe to call from inside the listener's own callback.
    /// If the registry is already gone the removal is skipped, but the
    /// teardown still runs once.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }

        match self.inner.registry.upgrade() {
            Some(registry) => {
                registry.detach(self.inner.id);
            }
            None => trace!(subscription = %self.inner.id, "Registry already dropped"),
        }

        let teardown = lock(&self.inner.on_cancel).take();
        if let Some(teardown) = teardown {
            teardown();
        }

        trace!(subscription = %self.inner.id, "Subscription cancelled");
        true
    }

    /// Invoke the listener. Called by the registry outside its lock.
    pub(crate) fn deliver(&self, value: &T) {
        (self.inner.on_event)(value, self);
    }

    pub(crate) fn belongs_to(&self, registry: &Arc<RegistryInner<T>>) -> bool {
        std::ptr::eq(self.inner.registry.as_ptr(), Arc::as_ptr(registry))
    }
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for Subscription<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<T> Eq for Subscription<T> {}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl<T> Cancellable for Subscription<T> {
    fn cancel(&self) -> bool {
        Subscription::cancel(self)
    }
}
