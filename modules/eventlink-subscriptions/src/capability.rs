//! CapabilityCounter: reconciles independent on/off requesters.
//!
//! Each key tracks the last externally declared desire plus a count of
//! internal consumers (open streams, pending operations) that need the
//! capability on. Effective state = `internal > 0 || external`.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::sync::lock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityState {
    pub external: bool,
    pub internal: usize,
}

impl CapabilityState {
    pub fn is_desired(&self) -> bool {
        self.internal > 0 || self.external
    }
}

/// Per-key desired-state bookkeeping. Entries are created on first reference
/// and live as long as the counter. Cheap to clone; clones share state.
pub struct CapabilityCounter<K> {
    states: Arc<Mutex<HashMap<K, CapabilityState>>>,
}

impl<K> CapabilityCounter<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pub fn new() -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record the caller's explicit desire for `key`. Echoes `value` back so
    /// call sites can act on it directly.
    pub fn set_external(&self, key: &K, value: bool) -> bool {
        lock(&self.states).entry(key.clone()).or_default().external = value;
        debug!(key = ?key, external = value, "External capability desire recorded");
        value
    }

    /// One more internal consumer needs `key` on. Call before commanding the
    /// producer to enable it.
    pub fn add_internal_demand(&self, key: &K) {
        let internal = {
            let mut states = lock(&self.states);
            let state = states.entry(key.clone()).or_default();
            state.internal += 1;
            state.internal
        };
        debug!(key = ?key, internal, "Internal demand added");
    }

    /// One internal consumer for `key` is gone. Returns whether the
    /// capability should stay enabled for the remaining consumers or the
    /// external desire. Never goes below zero.
    pub fn remove_internal_demand(&self, key: &K) -> bool {
        let state = {
            let mut states = lock(&self.states);
            let state = states.entry(key.clone()).or_default();
            match state.internal.checked_sub(1) {
                Some(n) => state.internal = n,
                None => warn!(key = ?key, "Internal demand released below zero; clamping"),
            }
            *state
        };
        debug!(key = ?key, internal = state.internal, external = state.external, "Internal demand removed");
        state.is_desired()
    }

    /// Effective desired state for `key`.
    pub fn is_desired(&self, key: &K) -> bool {
        self.state(key).is_desired()
    }

    pub fn internal_demand(&self, key: &K) -> usize {
        self.state(key).internal
    }

    pub fn external(&self, key: &K) -> bool {
        self.state(key).external
    }

    pub fn state(&self, key: &K) -> CapabilityState {
        lock(&self.states).get(key).copied().unwrap_or_default()
    }
}

impl<K> Default for CapabilityCounter<K>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for CapabilityCounter<K> {
    fn clone(&self) -> Self {
        Self {
            states: Arc::clone(&self.states),
        }
    }
}
