//! Request/response bridge.
//!
//! Turns "send a command, then watch a channel" into a future with exactly
//! one outcome. A request arms up to three settlement paths:
//!
//! 1. a listener on the response channel that resolves on a matching event
//! 2. listeners on terminal channels (disconnect, shutdown) that resolve with
//!    `Disconnected`
//! 3. an optional timer that resolves with `TimedOut`
//!
//! plus the consumer dropping the future, which resolves with `Cancelled`.
//! Whichever path settles first disarms the others before returning. A late
//! attempt to settle is discarded and never reaches the consumer.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use eventlink_subscriptions::{Cancellable, SubscriptionRegistry};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::RequestError;
use crate::latch::Latch;

type Outcome<V, E> = Result<V, RequestError<E>>;
type Matcher<Ev, V, E> = Box<dyn Fn(&Ev) -> Option<Result<V, E>> + Send + Sync>;
type Cleanup = Box<dyn FnOnce() + Send>;
type ArmTerminal<V, E> = Box<dyn FnOnce(Weak<Outstanding<V, E>>) -> Box<dyn Cancellable> + Send>;

// ---------------------------------------------------------------------------
// Outstanding
// ---------------------------------------------------------------------------

struct Outstanding<V, E> {
    id: Uuid,
    latch: Latch<Settlement<V, E>>,
}

struct Settlement<V, E> {
    reply: oneshot::Sender<Outcome<V, E>>,
    cleanup: Option<Cleanup>,
}

impl<V, E> Outstanding<V, E> {
    /// Settle the request. Returns `false` if another path already did.
    fn resolve(&self, outcome: Outcome<V, E>) -> bool {
        let Some(settlement) = self.latch.trip() else {
            trace!(request = %self.id, "Request already settled; discarding late outcome");
            return false;
        };

        if outcome.is_err() {
            if let Some(cleanup) = settlement.cleanup {
                cleanup();
            }
        }

        debug!(request = %self.id, ok = outcome.is_ok(), "Request settled");
        // The consumer may have stopped listening; nothing left to do then.
        let _ = settlement.reply.send(outcome);
        true
    }
}

/// Timer task as a settlement guard.
struct TimerGuard(AbortHandle);

impl Cancellable for TimerGuard {
    fn cancel(&self) -> bool {
        let was_running = !self.0.is_finished();
        self.0.abort();
        was_running
    }
}

// ---------------------------------------------------------------------------
// RequestBuilder
// ---------------------------------------------------------------------------

/// Describes one outstanding operation before its command is sent.
///
/// ```ignore
/// let pending = RequestBuilder::new(&responses, |ev: &Response| ev.result_for(op_id))
///     .with_terminal(&disconnects, |_| true)
///     .with_timeout(Duration::from_secs(5))
///     .with_cleanup(move || transport.cancel(op_id))
///     .dispatch(|| transport.send(op_id, command));
/// let value = pending.await?;
/// ```
pub struct RequestBuilder<Ev, V, E> {
    events: SubscriptionRegistry<Ev>,
    matcher: Matcher<Ev, V, E>,
    terminals: Vec<ArmTerminal<V, E>>,
    timeout: Option<Duration>,
    cleanup: Option<Cleanup>,
}

impl<Ev, V, E> RequestBuilder<Ev, V, E>
where
    Ev: 'static,
    V: Send + 'static,
    E: Send + 'static,
{
    /// `matcher` returns `Some` for the event that answers this request:
    /// `Ok` for success, `Err` for a domain failure. Other events are ignored.
    pub fn new<M>(events: &SubscriptionRegistry<Ev>, matcher: M) -> Self
    where
        M: Fn(&Ev) -> Option<Result<V, E>> + Send + Sync + 'static,
    {
        Self {
            events: events.clone(),
            matcher: Box::new(matcher),
            terminals: Vec::new(),
            timeout: None,
            cleanup: None,
        }
    }

    /// Resolve with `Disconnected` when `is_terminal` accepts a value on `channel`.
    pub fn with_terminal<T, F>(mut self, channel: &SubscriptionRegistry<T>, is_terminal: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let channel = channel.clone();
        self.terminals.push(Box::new(move |outstanding| {
            let subscription = channel.subscribe(move |value, _| {
                if !is_terminal(value) {
                    return;
                }
                if let Some(outstanding) = outstanding.upgrade() {
                    outstanding.resolve(Err(RequestError::Disconnected));
                }
            });
            Box::new(subscription) as Box<dyn Cancellable>
        }));
        self
    }

    /// Resolve with `TimedOut` if nothing else settles within `timeout`.
    /// The timer runs on the current Tokio runtime.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_optional_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Producer-facing cleanup (e.g. cancel the outstanding command). Runs
    /// once for any outcome other than success, including cancellation.
    pub fn with_cleanup<C>(mut self, cleanup: C) -> Self
    where
        C: FnOnce() + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    /// Arm every listener, then issue the command through `send`.
    ///
    /// Listeners go in first so a response delivered synchronously from
    /// inside `send` is not missed. An error from `send` settles the request
    /// as a domain failure.
    pub fn dispatch<S>(self, send: S) -> PendingRequest<V, E>
    where
        S: FnOnce() -> Result<(), E>,
    {
        let (reply, receiver) = oneshot::channel();
        let outstanding = Arc::new(Outstanding {
            id: Uuid::new_v4(),
            latch: Latch::new(Settlement {
                reply,
                cleanup: self.cleanup,
            }),
        });
        debug!(request = %outstanding.id, "Request armed");

        let matcher = self.matcher;
        let weak = Arc::downgrade(&outstanding);
        let primary = self.events.subscribe(move |event, _| {
            let Some(result) = matcher(event) else {
                return;
            };
            if let Some(outstanding) = weak.upgrade() {
                outstanding.resolve(result.map_err(RequestError::Failed));
            }
        });
        outstanding.latch.arm(Box::new(primary));

        for arm_terminal in self.terminals {
            let guard = arm_terminal(Arc::downgrade(&outstanding));
            outstanding.latch.arm(guard);
        }

        if let Some(timeout) = self.timeout {
            arm_timer(&outstanding, timeout);
        }

        if let Err(err) = send() {
            outstanding.resolve(Err(RequestError::Failed(err)));
        }

        PendingRequest {
            receiver: Some(receiver),
            ready: None,
            outstanding: Some(outstanding),
        }
    }
}

fn arm_timer<V, E>(outstanding: &Arc<Outstanding<V, E>>, timeout: Duration)
where
    V: Send + 'static,
    E: Send + 'static,
{
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            warn!(request = %outstanding.id, "No Tokio runtime; request has no deadline");
            return;
        }
    };

    let weak = Arc::downgrade(outstanding);
    let timer = runtime.spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(outstanding) = weak.upgrade() {
            if outstanding.resolve(Err(RequestError::TimedOut(timeout))) {
                debug!(request = %outstanding.id, ?timeout, "Request timed out");
            }
        }
    });
    outstanding.latch.arm(Box::new(TimerGuard(timer.abort_handle())));
}

// ---------------------------------------------------------------------------
// PendingRequest
// ---------------------------------------------------------------------------

/// The consumer side of a request. Resolves exactly once.
///
/// Dropping it before it resolves settles the request as `Cancelled`, which
/// disarms the listeners and runs the request's cleanup.
pub struct PendingRequest<V, E> {
    receiver: Option<oneshot::Receiver<Outcome<V, E>>>,
    ready: Option<Outcome<V, E>>,
    outstanding: Option<Arc<Outstanding<V, E>>>,
}

impl<V, E> PendingRequest<V, E> {
    /// A request that is already settled, e.g. rejected before dispatch.
    pub fn ready(outcome: Outcome<V, E>) -> Self {
        Self {
            receiver: None,
            ready: Some(outcome),
            outstanding: None,
        }
    }

    /// Abandon the request explicitly. Same as dropping it.
    pub fn cancel(self) {}

    pub fn is_settled(&self) -> bool {
        match &self.outstanding {
            Some(outstanding) => outstanding.latch.is_tripped(),
            None => true,
        }
    }
}

// No field is ever pinned; the outcome is moved out by value.
impl<V, E> Unpin for PendingRequest<V, E> {}

impl<V, E> Future for PendingRequest<V, E> {
    type Output = Outcome<V, E>;

    /// Polling again after completion yields `Cancelled`.
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.ready.take() {
            return Poll::Ready(outcome);
        }

        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Ready(Err(RequestError::Cancelled));
        };

        match Pin::new(receiver).poll(cx) {
            Poll::Ready(received) => {
                self.receiver = None;
                self.outstanding = None;
                // A dropped sender means the settlement vanished unsent.
                Poll::Ready(received.unwrap_or(Err(RequestError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<V, E> Drop for PendingRequest<V, E> {
    fn drop(&mut self) {
        if let Some(outstanding) = self.outstanding.take() {
            outstanding.resolve(Err(RequestError::Cancelled));
        }
    }
}
