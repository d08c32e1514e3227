//! Stream bridge.
//!
//! Opening a stream starts listening for values and for terminal events, then
//! takes one unit of internal demand on its capability and asks the producer
//! to turn it on. The stream ends on the first of: consumer cancellation (or
//! drop), a disconnect, or the capability being turned off out-of-band. Ending
//! releases the demand; the producer is told to turn the capability off only
//! when nobody else (stream or explicit toggle) still wants it.

use std::fmt;
use std::hash::Hash;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use eventlink_subscriptions::sync::lock;
use eventlink_subscriptions::{CapabilityCounter, Cancellable, SubscriptionRegistry};
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StreamEnd;
use crate::latch::Latch;

type Matcher<Ev, V> = Box<dyn Fn(&Ev) -> Option<V> + Send + Sync>;
type OnTermination = Box<dyn FnOnce(StreamEnd) + Send>;
type ArmTerminal<V> = Box<dyn FnOnce(Weak<StreamShared<V>>) -> Box<dyn Cancellable> + Send>;

// ---------------------------------------------------------------------------
// CapabilityControl
// ---------------------------------------------------------------------------

/// Producer-facing switch for a capability (e.g. "notify on changes to X").
///
/// Called with no engine lock held; implementations may call straight back
/// into the engine. Must tolerate repeated requests for the same state.
pub trait CapabilityControl<K>: Send + Sync {
    fn set_capability(&self, key: &K, enabled: bool);
}

/// One stream's hold on a capability. Taken at most once; releasing a lease
/// that was never taken makes a later `acquire` a no-op.
trait Lease: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Idle,
    Held,
    Released,
}

struct Demand<K> {
    key: K,
    counter: CapabilityCounter<K>,
    control: Arc<dyn CapabilityControl<K>>,
    state: Mutex<LeaseState>,
}

impl<K> Lease for Demand<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync,
{
    fn acquire(&self) {
        {
            let mut state = lock(&self.state);
            if *state != LeaseState::Idle {
                debug!(key = ?self.key, "Stream ended before taking demand");
                return;
            }
            *state = LeaseState::Held;
            self.counter.add_internal_demand(&self.key);
        }

        self.control.set_capability(&self.key, true);

        // A release racing the "on" command may have reached the producer
        // first; make sure the last word matches the counter.
        let released = *lock(&self.state) == LeaseState::Released;
        if released && !self.counter.is_desired(&self.key) {
            self.control.set_capability(&self.key, false);
        }
    }

    fn release(&self) {
        let previous = mem::replace(&mut *lock(&self.state), LeaseState::Released);
        if previous != LeaseState::Held {
            return;
        }
        if !self.counter.remove_internal_demand(&self.key) {
            debug!(key = ?self.key, "Last consumer gone; disabling capability");
            self.control.set_capability(&self.key, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Shared stream state
// ---------------------------------------------------------------------------

struct StreamShared<V> {
    id: Uuid,
    sender: Mutex<Option<mpsc::UnboundedSender<V>>>,
    latch: Latch<Teardown>,
    buffered: AtomicUsize,
    buffer_warn: usize,
}

struct Teardown {
    lease: Option<Arc<dyn Lease>>,
    on_termination: Option<OnTermination>,
}

impl<V> StreamShared<V> {
    fn push(&self, value: V) {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return;
        };
        // Counted before sending so the consumer's decrement never runs first.
        let buffered = self.buffered.fetch_add(1, Ordering::AcqRel) + 1;
        if sender.send(value).is_err() {
            self.buffered.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        if buffered == self.buffer_warn {
            warn!(stream = %self.id, buffered, "Stream consumer is falling behind");
        }
    }

    /// End the stream. Only the first caller does anything.
    fn finish(&self, reason: StreamEnd) -> bool {
        // Disarms the value and terminal listeners.
        let Some(teardown) = self.latch.trip() else {
            return false;
        };

        let sender = lock(&self.sender).take();
        drop(sender);

        debug!(stream = %self.id, %reason, "Stream ended");

        if let Some(lease) = teardown.lease {
            lease.release();
        }
        if let Some(on_termination) = teardown.on_termination {
            on_termination(reason);
        }
        true
    }
}

// ---------------------------------------------------------------------------
// StreamBuilder
// ---------------------------------------------------------------------------

pub struct StreamBuilder<Ev, V> {
    values: SubscriptionRegistry<Ev>,
    matcher: Matcher<Ev, V>,
    terminals: Vec<ArmTerminal<V>>,
    lease: Option<Arc<dyn Lease>>,
    on_termination: Option<OnTermination>,
    buffer_warn: usize,
}

impl<Ev, V> StreamBuilder<Ev, V>
where
    Ev: 'static,
    V: Send + 'static,
{
    /// `matcher` maps an event on `values` to a stream item, or `None` to skip it.
    pub fn new<M>(values: &SubscriptionRegistry<Ev>, matcher: M) -> Self
    where
        M: Fn(&Ev) -> Option<V> + Send + Sync + 'static,
    {
        Self {
            values: values.clone(),
            matcher: Box::new(matcher),
            terminals: Vec::new(),
            lease: None,
            on_termination: None,
            buffer_warn: usize::MAX,
        }
    }

    /// End the stream when `classify` maps a value on `channel` to a reason.
    /// May be called for several channels.
    pub fn with_terminal<T, F>(mut self, channel: &SubscriptionRegistry<T>, classify: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> Option<StreamEnd> + Send + Sync + 'static,
    {
        let channel = channel.clone();
        self.terminals.push(Box::new(move |shared| {
            let subscription = channel.subscribe(move |value, _| {
                let Some(reason) = classify(value) else {
                    return;
                };
                if let Some(shared) = shared.upgrade() {
                    shared.finish(reason);
                }
            });
            Box::new(subscription) as Box<dyn Cancellable>
        }));
        self
    }

    /// Hold one unit of internal demand on `key` while the stream is open.
    pub fn with_capability<K>(
        mut self,
        key: K,
        counter: CapabilityCounter<K>,
        control: Arc<dyn CapabilityControl<K>>,
    ) -> Self
    where
        K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    {
        self.lease = Some(Arc::new(Demand {
            key,
            counter,
            control,
            state: Mutex::new(LeaseState::Idle),
        }));
        self
    }

    /// Called once with the reason the stream ended.
    pub fn on_termination<C>(mut self, on_termination: C) -> Self
    where
        C: FnOnce(StreamEnd) + Send + 'static,
    {
        self.on_termination = Some(Box::new(on_termination));
        self
    }

    pub fn with_buffer_warn(mut self, buffer_warn: usize) -> Self {
        self.buffer_warn = buffer_warn;
        self
    }

    /// Arm the value and terminal listeners, then take the capability. A
    /// producer may answer the "on" command synchronously, with values or a
    /// terminal report, and the stream sees it.
    pub fn open(self) -> EventStream<V> {
        let lease = self.lease;
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared {
            id: Uuid::new_v4(),
            sender: Mutex::new(Some(sender)),
            latch: Latch::new(Teardown {
                lease: lease.clone(),
                on_termination: self.on_termination,
            }),
            buffered: AtomicUsize::new(0),
            buffer_warn: self.buffer_warn,
        });
        debug!(stream = %shared.id, "Stream opened");

        let matcher = self.matcher;
        let weak = Arc::downgrade(&shared);
        let values = self.values.subscribe(move |event, _| {
            let Some(value) = matcher(event) else {
                return;
            };
            if let Some(shared) = weak.upgrade() {
                shared.push(value);
            }
        });
        shared.latch.arm(Box::new(values));

        for arm_terminal in self.terminals {
            let guard = arm_terminal(Arc::downgrade(&shared));
            shared.latch.arm(guard);
        }

        if let Some(lease) = lease {
            lease.acquire();
        }

        EventStream { shared, receiver }
    }
}

// ---------------------------------------------------------------------------
// EventStream
// ---------------------------------------------------------------------------

/// Consumer side of a stream. Yields values in delivery order, then `None`
/// once the stream has ended and every buffered value has been taken.
///
/// Dropping it cancels the stream.
pub struct EventStream<V> {
    shared: Arc<StreamShared<V>>,
    receiver: mpsc::UnboundedReceiver<V>,
}

impl<V> EventStream<V> {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Stop the stream. Idempotent; returns `true` only if this call ended it.
    pub fn cancel(&self) -> bool {
        self.shared.finish(StreamEnd::Cancelled)
    }

    /// Whether the stream has ended (buffered values may remain).
    pub fn is_finished(&self) -> bool {
        self.shared.latch.is_tripped()
    }
}

impl<V> Unpin for EventStream<V> {}

impl<V> Stream for EventStream<V> {
    type Item = V;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<V>> {
        let polled = self.receiver.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.shared.buffered.fetch_sub(1, Ordering::AcqRel);
        }
        polled
    }
}

impl<V> Drop for EventStream<V> {
    fn drop(&mut self) {
        self.shared.finish(StreamEnd::Cancelled);
    }
}

impl<V> fmt::Debug for EventStream<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.shared.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[derive(Default)]
    struct Commands(Mutex<Vec<bool>>);

    impl CapabilityControl<u8> for Commands {
        fn set_capability(&self, _key: &u8, enabled: bool) {
            self.0.lock().unwrap().push(enabled);
        }
    }

    fn demand(counter: &CapabilityCounter<u8>, control: &Arc<Commands>) -> Demand<u8> {
        let control: Arc<dyn CapabilityControl<u8>> = control.clone();
        Demand {
            key: 1,
            counter: counter.clone(),
            control,
            state: Mutex::new(LeaseState::Idle),
        }
    }

    #[test]
    fn lease_released_before_acquire_never_takes_demand() {
        let counter = CapabilityCounter::new();
        let control = Arc::new(Commands::default());
        let lease = demand(&counter, &control);

        lease.release();
        lease.acquire();

        assert_eq!(counter.internal_demand(&1), 0);
        assert!(control.0.lock().unwrap().is_empty());
    }

    #[test]
    fn lease_is_taken_and_returned_once() {
        let counter = CapabilityCounter::new();
        let control = Arc::new(Commands::default());
        let lease = demand(&counter, &control);

        lease.acquire();
        lease.acquire();
        assert_eq!(counter.internal_demand(&1), 1);

        lease.release();
        lease.release();
        assert_eq!(counter.internal_demand(&1), 0);
        assert_eq!(*control.0.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn buffered_count_stays_in_range_with_producer_on_another_thread() {
        let values: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let mut stream = StreamBuilder::new(&values, |v: &u32| Some(*v)).open();
        let total = 5_000u32;

        let producer = values.clone();
        let thread = std::thread::spawn(move || {
            for v in 0..total {
                producer.receive(&v);
            }
        });

        for expected in 0..total {
            assert_eq!(stream.next().await, Some(expected));
            assert!(stream.shared.buffered.load(Ordering::Acquire) <= total as usize);
        }
        thread.join().unwrap();
        assert_eq!(stream.shared.buffered.load(Ordering::Acquire), 0);
    }

    #[test]
    fn push_after_finish_is_not_counted() {
        let values: SubscriptionRegistry<u32> = SubscriptionRegistry::new();
        let stream = StreamBuilder::new(&values, |v: &u32| Some(*v)).open();

        stream.cancel();
        stream.shared.push(7);

        assert_eq!(stream.shared.buffered.load(Ordering::Acquire), 0);
    }
}
