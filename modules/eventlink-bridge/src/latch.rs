//! First-writer-wins settlement shared by the request and stream bridges.
//!
//! Every path that can settle an operation (matching event, terminal event,
//! timer, consumer cancellation) races on `trip`. Exactly one caller gets the
//! payload; the armed guards are disarmed before that caller proceeds, so no
//! losing path can fire afterwards. A guard armed after the latch tripped is
//! disarmed on the spot.

use std::mem;
use std::sync::Mutex;

use eventlink_subscriptions::sync::lock;
use eventlink_subscriptions::Cancellable;

pub(crate) struct Latch<P> {
    state: Mutex<LatchState<P>>,
}

struct LatchState<P> {
    payload: Option<P>,
    guards: Vec<Box<dyn Cancellable>>,
}

impl<P> Latch<P> {
    pub(crate) fn new(payload: P) -> Self {
        Self {
            state: Mutex::new(LatchState {
                payload: Some(payload),
                guards: Vec::new(),
            }),
        }
    }

    pub(crate) fn arm(&self, guard: Box<dyn Cancellable>) {
        {
            let mut state = lock(&self.state);
            if state.payload.is_some() {
                state.guards.push(guard);
                return;
            }
        }
        guard.cancel();
    }

    /// Settle. Returns the payload to the first caller only.
    pub(crate) fn trip(&self) -> Option<P> {
        let (payload, guards) = {
            let mut state = lock(&self.state);
            let payload = state.payload.take()?;
            (payload, mem::take(&mut state.guards))
        };

        for guard in guards {
            guard.cancel();
        }
        Some(payload)
    }

    pub(crate) fn is_tripped(&self) -> bool {
        lock(&self.state).payload.is_none()
    }
}
