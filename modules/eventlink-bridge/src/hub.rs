//! Hub: the owning context for one transport.
//!
//! Wires the channels a transport feeds (per-entity events, global events,
//! disconnects, capability state) to the request and stream bridges, and owns
//! the capability counter and the set of attached entities.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use eventlink_subscriptions::sync::{read, write};
use eventlink_subscriptions::{CapabilityCounter, KeyedRegistry, SubscriptionRegistry};
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::{StreamEnd, UnknownKey};
use crate::request::{PendingRequest, RequestBuilder};
use crate::stream::{CapabilityControl, EventStream, StreamBuilder};

/// Terminal event: the source behind a key (or every key) is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// The producer's report of a capability's actual state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityEvent {
    pub enabled: bool,
    pub error: Option<String>,
}

pub struct Hub<K, Ev> {
    events: KeyedRegistry<K, Ev>,
    global: SubscriptionRegistry<Ev>,
    disconnects: KeyedRegistry<K, Disconnected>,
    shutdown: SubscriptionRegistry<Disconnected>,
    capability_states: KeyedRegistry<K, CapabilityEvent>,
    capabilities: CapabilityCounter<K>,
    attached: RwLock<HashSet<K>>,
    control: Arc<dyn CapabilityControl<K>>,
    config: BridgeConfig,
}

impl<K, Ev> Hub<K, Ev>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    Ev: 'static,
{
    pub fn new(control: Arc<dyn CapabilityControl<K>>, config: BridgeConfig) -> Self {
        Self {
            events: KeyedRegistry::new(),
            global: SubscriptionRegistry::new(),
            disconnects: KeyedRegistry::new(),
            shutdown: SubscriptionRegistry::new(),
            capability_states: KeyedRegistry::new(),
            capabilities: CapabilityCounter::new(),
            attached: RwLock::new(HashSet::new()),
            control,
            config,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Entity lifecycle
    // -----------------------------------------------------------------------

    /// Make `key` known. Returns `false` if it already was.
    pub fn attach(&self, key: K) -> bool {
        let added = write(&self.attached).insert(key.clone());
        if added {
            info!(key = ?key, "Entity attached");
        }
        added
    }

    pub fn is_attached(&self, key: &K) -> bool {
        read(&self.attached).contains(key)
    }

    /// Forget `key` and end everything pending on it. Later operations on
    /// the key fail with `NotFound` until it is attached again.
    pub fn detach(&self, key: &K) {
        let removed = write(&self.attached).remove(key);
        if removed {
            info!(key = ?key, "Entity detached");
        }
        self.disconnect(key);
    }

    /// Deliver a disconnect for `key` to every pending request and stream on it.
    pub fn disconnect(&self, key: &K) -> usize {
        let delivered = self.disconnects.receive(key, &Disconnected);
        debug!(key = ?key, delivered, "Disconnect delivered");
        delivered
    }

    /// Forget every entity and end every pending operation, keyed or global.
    pub fn shutdown(&self) -> usize {
        write(&self.attached).clear();
        let delivered = self.shutdown.receive(&Disconnected);
        info!(delivered, "Hub shut down");
        delivered
    }

    // -----------------------------------------------------------------------
    // Producer entry points
    // -----------------------------------------------------------------------

    pub fn receive(&self, key: &K, event: &Ev) -> usize {
        self.events.receive(key, event)
    }

    pub fn receive_global(&self, event: &Ev) -> usize {
        self.global.receive(event)
    }

    /// The producer reports the actual state of a capability. An off report
    /// ends every stream on `key` when it carries an error or when nothing
    /// wants the capability any more. A plain off while demand is held is
    /// taken as a stale acknowledgement of an earlier off command.
    pub fn capability_changed(&self, key: &K, enabled: bool, error: Option<String>) -> usize {
        if !enabled && error.is_none() && self.capabilities.is_desired(key) {
            debug!(key = ?key, "Capability reported off while still desired; treating as stale");
        }
        self.capability_states
            .receive(key, &CapabilityEvent { enabled, error })
    }

    // -----------------------------------------------------------------------
    // Capabilities
    // -----------------------------------------------------------------------

    /// Explicit on/off toggle from the consumer-facing API. The producer is
    /// commanded with the effective state, so turning the toggle off leaves
    /// the capability on while streams still need it. Echoes `enabled`.
    pub fn set_capability(&self, key: &K, enabled: bool) -> bool {
        let echoed = self.capabilities.set_external(key, enabled);
        let effective = self.capabilities.is_desired(key);
        self.control.set_capability(key, effective);
        echoed
    }

    pub fn is_desired(&self, key: &K) -> bool {
        self.capabilities.is_desired(key)
    }

    pub fn internal_demand(&self, key: &K) -> usize {
        self.capabilities.internal_demand(key)
    }

    pub fn capabilities(&self) -> &CapabilityCounter<K> {
        &self.capabilities
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// A request on `key`, pre-wired with its disconnect and shutdown
    /// terminals and the configured timeout. Fails fast for unknown keys.
    pub fn prepare<V, E, M>(&self, key: &K, matcher: M) -> Result<RequestBuilder<Ev, V, E>, UnknownKey>
    where
        V: Send + 'static,
        E: Send + 'static,
        M: Fn(&Ev) -> Option<Result<V, E>> + Send + Sync + 'static,
    {
        self.ensure_attached(key)?;
        Ok(RequestBuilder::new(&self.events.registry(key), matcher)
            .with_terminal(&self.disconnects.registry(key), |_| true)
            .with_terminal(&self.shutdown, |_| true)
            .with_optional_timeout(self.config.request_timeout))
    }

    /// Send a command for `key` and wait for the event `matcher` picks out.
    pub fn request<V, E, M, S>(&self, key: &K, matcher: M, send: S) -> PendingRequest<V, E>
    where
        V: Send + 'static,
        E: Send + 'static,
        M: Fn(&Ev) -> Option<Result<V, E>> + Send + Sync + 'static,
        S: FnOnce() -> Result<(), E>,
    {
        match self.prepare(key, matcher) {
            Ok(builder) => builder.dispatch(send),
            Err(err) => PendingRequest::ready(Err(err.into())),
        }
    }

    /// A request answered on the global channel, ended only by shutdown.
    pub fn prepare_global<V, E, M>(&self, matcher: M) -> RequestBuilder<Ev, V, E>
    where
        V: Send + 'static,
        E: Send + 'static,
        M: Fn(&Ev) -> Option<Result<V, E>> + Send + Sync + 'static,
    {
        RequestBuilder::new(&self.global, matcher)
            .with_terminal(&self.shutdown, |_| true)
            .with_optional_timeout(self.config.request_timeout)
    }

    pub fn request_global<V, E, M, S>(&self, matcher: M, send: S) -> PendingRequest<V, E>
    where
        V: Send + 'static,
        E: Send + 'static,
        M: Fn(&Ev) -> Option<Result<V, E>> + Send + Sync + 'static,
        S: FnOnce() -> Result<(), E>,
    {
        self.prepare_global(matcher).dispatch(send)
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// A stream of the values `matcher` picks out of `key`'s events, holding
    /// the capability for `key` while open.
    pub fn prepare_stream<V, M>(&self, key: &K, matcher: M) -> Result<StreamBuilder<Ev, V>, UnknownKey>
    where
        V: Send + 'static,
        M: Fn(&Ev) -> Option<V> + Send + Sync + 'static,
    {
        self.ensure_attached(key)?;
        Ok(StreamBuilder::new(&self.events.registry(key), matcher)
            .with_terminal(&self.disconnects.registry(key), |_| {
                Some(StreamEnd::Disconnected)
            })
            .with_terminal(&self.capability_states.registry(key), {
                let key = key.clone();
                let capabilities = self.capabilities.clone();
                move |state| {
                    let forced_off = !state.enabled
                        && (state.error.is_some() || !capabilities.is_desired(&key));
                    forced_off.then(|| StreamEnd::CapabilityDisabled {
                        error: state.error.clone(),
                    })
                }
            })
            .with_terminal(&self.shutdown, |_| Some(StreamEnd::Disconnected))
            .with_capability(key.clone(), self.capabilities.clone(), Arc::clone(&self.control))
            .with_buffer_warn(self.config.stream_buffer_warn))
    }

    pub fn stream<V, M>(&self, key: &K, matcher: M) -> Result<EventStream<V>, UnknownKey>
    where
        V: Send + 'static,
        M: Fn(&Ev) -> Option<V> + Send + Sync + 'static,
    {
        Ok(self.prepare_stream(key, matcher)?.open())
    }

    fn ensure_attached(&self, key: &K) -> Result<(), UnknownKey> {
        if self.is_attached(key) {
            Ok(())
        } else {
            Err(UnknownKey(format!("{key:?}")))
        }
    }
}
